// ── Mnemo Store: Node CRUD ──────────────────────────────────────────────────
//
// Long-term memory rows. Writes dedupe on content_hash (SHA-256); deletes
// are tombstones by default. Every reader in this file filters
// `deleted_at IS NULL` unless the caller explicitly opts into tombstones.

use super::embedding::{bytes_to_f32_vec, f32_vec_to_bytes, zero_pad};
use super::{now_str, parse_ts, MemoryStore};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Node, SaveOutcome, StoreStats};
use chrono::Duration;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// SHA-256 of content, hex-encoded. The functional key for dedup.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub(super) fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let embedding_blob: Option<Vec<u8>> = row.get(3)?;
    let metadata_json: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(10)?;
    Ok(Node {
        id: row.get(0)?,
        content: row.get(1)?,
        content_hash: row.get(2)?,
        embedding: embedding_blob.map(|b| bytes_to_f32_vec(&b)),
        embedding_dimension: row.get::<_, Option<i64>>(4)?.map(|d| d as usize),
        token_count: row.get::<_, i64>(5)? as usize,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        is_proposition: row.get::<_, i64>(7)? != 0,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
        deleted_at: deleted_at.map(|s| parse_ts(&s)),
    })
}

const NODE_COLUMNS: &str = "id, content, content_hash, embedding, embedding_dimension, \
     token_count, metadata, is_proposition, created_at, updated_at, deleted_at";

impl MemoryStore {
    /// Persist content into long-term memory. If a row with the same content
    /// hash already exists it is returned untouched (`is_new == false`) —
    /// the caller must not schedule enrichment for it.
    pub fn save_node(
        &self,
        content: &str,
        token_count: usize,
        metadata: &HashMap<String, serde_json::Value>,
        is_proposition: bool,
    ) -> EngineResult<SaveOutcome> {
        let hash = content_hash(content);
        let conn = self.conn();

        let existing: Option<(i64, i64)> = conn
            .query_row(
                "SELECT id, token_count FROM nodes WHERE content_hash = ?1",
                params![hash],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((id, tokens)) = existing {
            return Ok(SaveOutcome { node_id: id, is_new: false, token_count: tokens as usize });
        }

        let metadata_json = serde_json::to_string(metadata)?;
        conn.execute(
            "INSERT INTO nodes (content, content_hash, token_count, metadata, is_proposition)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![content, hash, token_count as i64, metadata_json, is_proposition as i64],
        )?;
        let id = conn.last_insert_rowid();

        Ok(SaveOutcome { node_id: id, is_new: true, token_count })
    }

    /// Fetch a live node by id.
    pub fn get_node(&self, id: i64) -> EngineResult<Option<Node>> {
        let conn = self.conn();
        let node = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1 AND deleted_at IS NULL"),
                params![id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Fetch a node by id including tombstoned rows.
    pub fn get_node_any(&self, id: i64) -> EngineResult<Option<Node>> {
        let conn = self.conn();
        let node = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    /// Fetch several live nodes, keyed by id.
    pub fn get_nodes(&self, ids: &[i64]) -> EngineResult<HashMap<i64, Node>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({placeholders}) AND deleted_at IS NULL"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), node_from_row)?;
        let mut out = HashMap::with_capacity(ids.len());
        for row in rows {
            let node = row?;
            out.insert(node.id, node);
        }
        Ok(out)
    }

    /// Write the (zero-padded) embedding and the dimension the provider
    /// actually produced.
    pub fn set_embedding(&self, id: i64, vector: &[f32], dimension: usize) -> EngineResult<()> {
        let padded = zero_pad(vector.to_vec(), dimension.max(vector.len()));
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET embedding = ?1, embedding_dimension = ?2, updated_at = ?3
             WHERE id = ?4",
            params![f32_vec_to_bytes(&padded), vector.len() as i64, now_str(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Replace node content: recomputes the hash, drops the stale embedding
    /// (the caller re-enriches), bumps `updated_at`.
    pub fn update_node_content(
        &self,
        id: i64,
        content: &str,
        token_count: usize,
    ) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes
             SET content = ?1, content_hash = ?2, token_count = ?3,
                 embedding = NULL, embedding_dimension = NULL, updated_at = ?4
             WHERE id = ?5 AND deleted_at IS NULL",
            params![content, content_hash(content), token_count as i64, now_str(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Overwrite a node's metadata map.
    pub fn update_node_metadata(
        &self,
        id: i64,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET metadata = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
            params![serde_json::to_string(metadata)?, now_str(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Soft delete: sets the tombstone, keeps the row.
    pub fn soft_delete_node(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now_str(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Clear the tombstone. Restoring keeps the original id.
    pub fn restore_node(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE nodes SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NOT NULL",
            params![now_str(), id],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Hard delete: the row is gone; associations cascade.
    pub fn hard_delete_node(&self, id: i64) -> EngineResult<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(EngineError::not_found("node", id));
        }
        Ok(())
    }

    /// Hard-delete every tombstoned row older than `older_than`.
    /// Returns the number of rows purged.
    pub fn purge_deleted(&self, older_than: Duration) -> EngineResult<usize> {
        let cutoff = super::ts_str(chrono::Utc::now() - older_than);
        let conn = self.conn();
        let purged = conn.execute(
            "DELETE FROM nodes WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
            params![cutoff],
        )?;
        Ok(purged)
    }

    /// The tombstone-inclusive view: every soft-deleted node.
    pub fn tombstoned_nodes(&self) -> EngineResult<Vec<Node>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE deleted_at IS NOT NULL ORDER BY deleted_at DESC"
        ))?;
        let rows = stmt.query_map([], node_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Aggregate counts for the stats surface.
    pub fn stats(&self) -> EngineResult<StoreStats> {
        let conn = self.conn();
        let one = |sql: &str| -> EngineResult<u64> {
            Ok(conn.query_row(sql, [], |r| r.get::<_, i64>(0))? as u64)
        };
        Ok(StoreStats {
            nodes: one("SELECT COUNT(*) FROM nodes WHERE deleted_at IS NULL")?,
            embedded_nodes: one(
                "SELECT COUNT(*) FROM nodes WHERE deleted_at IS NULL AND embedding IS NOT NULL",
            )?,
            propositions: one(
                "SELECT COUNT(*) FROM nodes WHERE deleted_at IS NULL AND is_proposition = 1",
            )?,
            tombstoned: one("SELECT COUNT(*) FROM nodes WHERE deleted_at IS NOT NULL")?,
            tags: one("SELECT COUNT(*) FROM tags")?,
            robots: one("SELECT COUNT(*) FROM robots")?,
        })
    }
}
