// ── Mnemo Engine: Telemetry ─────────────────────────────────────────────────
//
// Operational visibility without an external metrics stack: ring-buffer
// latency samples per operation (avg/p50/p95/p99), connection-pool
// utilization with graded status, circuit-breaker exposure, cache counters,
// and a composed health report with a list of integrity issues.

use crate::atoms::constants::{LATENCY_WINDOW, POOL_CRITICAL_UTILIZATION, POOL_WARNING_UTILIZATION};
use crate::engine::breaker::{BreakerRegistry, BreakerState};
use crate::engine::query_cache::{CacheStats, QueryCache};
use crate::engine::store::{MemoryStore, PoolSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

// ═══════════════════════════════════════════════════════════════════════════
// Latency recording
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Default)]
struct LatencyWindows {
    windows: HashMap<String, VecDeque<f64>>,
}

/// Process-wide telemetry sink.
#[derive(Default)]
pub struct Telemetry {
    latencies: Mutex<LatencyWindows>,
}

/// RAII latency timer: records on drop.
pub struct LatencyTimer<'a> {
    telemetry: &'a Telemetry,
    operation: &'static str,
    start: Instant,
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        self.telemetry
            .record_latency(self.operation, self.start.elapsed().as_secs_f64() * 1000.0);
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one latency sample, in milliseconds. Windows are bounded;
    /// old samples roll off.
    pub fn record_latency(&self, operation: &str, ms: f64) {
        let mut inner = self.latencies.lock();
        let window = inner.windows.entry(operation.to_string()).or_default();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    /// Start a timer that records under `operation` when dropped.
    pub fn time(&self, operation: &'static str) -> LatencyTimer<'_> {
        LatencyTimer { telemetry: self, operation, start: Instant::now() }
    }

    /// Summary over the retained window for one operation.
    pub fn latency_summary(&self, operation: &str) -> Option<LatencySummary> {
        let inner = self.latencies.lock();
        let window = inner.windows.get(operation)?;
        summarize(window)
    }

    /// Summaries for every recorded operation.
    pub fn all_latencies(&self) -> HashMap<String, LatencySummary> {
        let inner = self.latencies.lock();
        inner
            .windows
            .iter()
            .filter_map(|(op, w)| summarize(w).map(|s| (op.clone(), s)))
            .collect()
    }

    /// Compose the full health report from the live components.
    pub fn report(
        &self,
        store: &MemoryStore,
        breakers: &BreakerRegistry,
        cache: &QueryCache,
    ) -> HealthReport {
        let pool = PoolHealth::from_snapshot(store.pool_snapshot());
        let breaker_rows: Vec<BreakerHealth> = breakers
            .snapshot()
            .into_iter()
            .map(|(service, state, failures, last_failure)| BreakerHealth {
                service,
                state: state.as_str(),
                failure_count: failures,
                last_failure_epoch_secs: last_failure,
            })
            .collect();

        let mut issues = Vec::new();
        if !store.fulltext_available() {
            issues.push("full-text index missing (FTS5 unavailable)".to_string());
        }
        match pool.status {
            PoolStatus::Critical => issues.push("connection pool critical".to_string()),
            PoolStatus::Exhausted => issues.push("connection pool exhausted".to_string()),
            _ => {}
        }
        for b in &breaker_rows {
            if b.state == "open" {
                issues.push(format!("circuit breaker open: {}", b.service));
            }
        }

        HealthReport {
            healthy: issues.is_empty(),
            pool,
            latencies: self.all_latencies(),
            breakers: breaker_rows,
            cache: cache.stats(),
            cache_resident_bytes: cache.resident_bytes(),
            issues,
        }
    }
}

fn summarize(window: &VecDeque<f64>) -> Option<LatencySummary> {
    if window.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg = sorted.iter().sum::<f64>() / sorted.len() as f64;
    Some(LatencySummary {
        count: sorted.len(),
        avg_ms: avg,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
    })
}

/// Nearest-rank percentile over a sorted sample.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

// ═══════════════════════════════════════════════════════════════════════════
// Health report
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Healthy,
    Warning,
    Critical,
    Exhausted,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolHealth {
    pub size: usize,
    pub in_use: usize,
    pub utilization: f64,
    pub contended: u64,
    pub status: PoolStatus,
}

impl PoolHealth {
    pub fn from_snapshot(snap: PoolSnapshot) -> Self {
        let utilization = if snap.size == 0 {
            0.0
        } else {
            snap.in_use as f64 / snap.size as f64
        };
        let status = if snap.size > 0 && snap.in_use >= snap.size {
            PoolStatus::Exhausted
        } else if utilization >= POOL_CRITICAL_UTILIZATION {
            PoolStatus::Critical
        } else if utilization >= POOL_WARNING_UTILIZATION {
            PoolStatus::Warning
        } else {
            PoolStatus::Healthy
        };
        Self {
            size: snap.size,
            in_use: snap.in_use,
            utilization,
            contended: snap.contended,
            status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub service: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub last_failure_epoch_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub pool: PoolHealth,
    pub latencies: HashMap<String, LatencySummary>,
    pub breakers: Vec<BreakerHealth>,
    pub cache: CacheStats,
    pub cache_resident_bytes: usize,
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_percentiles() {
        let t = Telemetry::new();
        for ms in 1..=100 {
            t.record_latency("recall", ms as f64);
        }
        let s = t.latency_summary("recall").unwrap();
        assert_eq!(s.count, 100);
        assert!((s.avg_ms - 50.5).abs() < 1e-9);
        assert_eq!(s.p50_ms, 50.0);
        assert_eq!(s.p95_ms, 95.0);
        assert_eq!(s.p99_ms, 99.0);
    }

    #[test]
    fn test_latency_window_bounded() {
        let t = Telemetry::new();
        for ms in 0..(LATENCY_WINDOW + 100) {
            t.record_latency("op", ms as f64);
        }
        assert_eq!(t.latency_summary("op").unwrap().count, LATENCY_WINDOW);
    }

    #[test]
    fn test_no_samples_no_summary() {
        let t = Telemetry::new();
        assert!(t.latency_summary("never").is_none());
    }

    #[test]
    fn test_timer_records() {
        let t = Telemetry::new();
        {
            let _timer = t.time("scoped");
        }
        assert_eq!(t.latency_summary("scoped").unwrap().count, 1);
    }

    #[test]
    fn test_pool_status_thresholds() {
        let mk = |size, in_use| {
            PoolHealth::from_snapshot(PoolSnapshot {
                size,
                in_use,
                contended: 0,
                acquired_total: 0,
            })
            .status
        };
        assert_eq!(mk(4, 0), PoolStatus::Healthy);
        assert_eq!(mk(4, 2), PoolStatus::Healthy);
        assert_eq!(mk(4, 3), PoolStatus::Warning);
        assert_eq!(mk(4, 4), PoolStatus::Exhausted);
        assert_eq!(mk(10, 9), PoolStatus::Critical);
    }

    #[test]
    fn test_report_healthy_on_fresh_store() {
        let store = MemoryStore::open_in_memory().unwrap();
        let breakers = BreakerRegistry::new();
        let cache = QueryCache::new(std::time::Duration::from_secs(60), 10);
        let t = Telemetry::new();

        let report = t.report(&store, &breakers, &cache);
        assert!(report.healthy);
        assert!(report.issues.is_empty());
        assert_eq!(report.pool.status, PoolStatus::Healthy);
    }

    #[test]
    fn test_report_flags_open_breaker() {
        let store = MemoryStore::open_in_memory().unwrap();
        let breakers = BreakerRegistry::new();
        let b = breakers.get("embedding", 1, 60);
        b.record_failure();
        let cache = QueryCache::new(std::time::Duration::from_secs(60), 10);

        let report = Telemetry::new().report(&store, &breakers, &cache);
        assert!(!report.healthy);
        assert!(report.issues.iter().any(|i| i.contains("embedding")));
        assert_eq!(report.breakers[0].state, "open");
    }
}
