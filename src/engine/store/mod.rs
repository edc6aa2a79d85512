// ── Mnemo Store ─────────────────────────────────────────────────────────────
// Relational persistence for the memory substrate, on SQLite via rusqlite.
//
// Module layout:
//   schema    — tables, FTS5 index, sync triggers, idempotent migrations
//   nodes     — node CRUD, content-hash dedup, soft delete / restore / purge
//   tags      — tag rows + node_tags associations
//   robots    — robot rows + robot_nodes associations (working-memory flag)
//   search    — vector scan, FTS5 BM25, tag candidate queries
//   embedding — bytes_to_f32_vec, f32_vec_to_bytes, cosine_similarity
//
// Concurrency: a small fixed pool of WAL-mode connections, each behind a
// parking_lot::Mutex. Readers spread across the pool; SQLite serializes
// writers via busy_timeout. In-memory stores force a pool of one (separate
// connections to ":memory:" would be separate databases).

use crate::atoms::error::EngineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub(crate) mod embedding;
mod nodes;
mod robots;
mod schema;
mod search;
mod tags;

pub use embedding::f32_vec_to_bytes;
pub use nodes::content_hash;
pub use search::{FulltextCandidate, TagCandidate, VectorCandidate};

/// Default number of pooled connections for on-disk stores.
const DEFAULT_POOL_SIZE: usize = 4;

/// Utilization snapshot for telemetry (§ pool health).
#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub size: usize,
    pub in_use: usize,
    /// Acquisitions that found every connection busy and had to block.
    pub contended: u64,
    pub acquired_total: u64,
}

/// Thread-safe database handle.
pub struct MemoryStore {
    pool: Vec<Mutex<Connection>>,
    in_use: AtomicUsize,
    contended: AtomicU64,
    acquired_total: AtomicU64,
}

/// RAII connection lease; decrements the in-use counter on drop.
pub struct PooledConn<'a> {
    guard: MutexGuard<'a, Connection>,
    store: &'a MemoryStore,
}

impl Deref for PooledConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        self.store.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MemoryStore {
    /// Open (or create) the database at `path` with the default pool size
    /// and run migrations.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::open_with_pool(path, DEFAULT_POOL_SIZE)
    }

    /// Open with an explicit pool size (clamped to ≥ 1).
    pub fn open_with_pool(path: impl AsRef<Path>, pool_size: usize) -> EngineResult<Self> {
        let path = path.as_ref();
        info!("[store] Opening memory store at {:?}", path);

        let mut pool = Vec::with_capacity(pool_size.max(1));
        for i in 0..pool_size.max(1) {
            let conn = Connection::open(path)?;
            Self::configure(&conn);
            if i == 0 {
                schema::run_migrations(&conn)?;
            }
            pool.push(Mutex::new(conn));
        }

        Ok(Self {
            pool,
            in_use: AtomicUsize::new(0),
            contended: AtomicU64::new(0),
            acquired_total: AtomicU64::new(0),
        })
    }

    /// In-memory store for tests. Pool size is one: separate connections to
    /// `:memory:` would each get their own private database.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn);
        schema::run_migrations(&conn)?;
        Ok(Self {
            pool: vec![Mutex::new(conn)],
            in_use: AtomicUsize::new(0),
            contended: AtomicU64::new(0),
            acquired_total: AtomicU64::new(0),
        })
    }

    fn configure(conn: &Connection) {
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA busy_timeout=5000;").ok();
        // Hard deletes must cascade into node_tags / robot_nodes.
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
    }

    /// Lease a connection. Prefers an idle one; blocks on the first slot
    /// when the whole pool is busy (and counts the contention for telemetry).
    pub(crate) fn conn(&self) -> PooledConn<'_> {
        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        for slot in &self.pool {
            if let Some(guard) = slot.try_lock() {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return PooledConn { guard, store: self };
            }
        }
        self.contended.fetch_add(1, Ordering::Relaxed);
        let guard = self.pool[0].lock();
        self.in_use.fetch_add(1, Ordering::Relaxed);
        PooledConn { guard, store: self }
    }

    /// Pool utilization counters for the health report.
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            size: self.pool.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
        }
    }

    /// True when the FTS5 module is available and the index exists — the
    /// store is unusable for recall without it.
    pub fn fulltext_available(&self) -> bool {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='nodes_fts'",
            [],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }
}

// ── Timestamp helpers ──────────────────────────────────────────────────────
// All timestamps are RFC 3339 UTC with millisecond precision, so string
// comparison in SQL agrees with chronological comparison in Rust.

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_str(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_and_migrate() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert!(store.fulltext_available());
        let snap = store.pool_snapshot();
        assert_eq!(snap.size, 1);
        assert_eq!(snap.in_use, 0);
    }

    #[test]
    fn test_conn_lease_counts() {
        let store = MemoryStore::open_in_memory().unwrap();
        {
            let _c = store.conn();
            assert_eq!(store.pool_snapshot().in_use, 1);
        }
        assert_eq!(store.pool_snapshot().in_use, 0);
        assert!(store.pool_snapshot().acquired_total >= 1);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts_str(now));
        assert!((parsed - now).num_milliseconds().abs() < 2);
    }
}
