// ── Mnemo Engine: Circuit Breaker ───────────────────────────────────────────
//
// Wraps every external provider call (embedding, tag, proposition) with a
// fail-fast state machine so a dead endpoint degrades to "node without that
// signal" instead of a pile-up of hung requests.
//
// States:
//   Closed   — normal operation, calls pass through
//   Open     — rejecting calls (cooldown active)
//   HalfOpen — cooldown expired, one probe call allowed
//
// Closed → Open after `threshold` consecutive failures. Open → HalfOpen after
// `cooldown_secs`. HalfOpen success → Closed (counter reset); HalfOpen
// failure → Open (trip timestamp refreshed).
//
// Lock-free: all state lives in atomics so the breaker can sit on the hot
// path of concurrent enrichment jobs.

use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    /// Dependency name, used in errors and logs.
    service: String,
    /// Consecutive failures since the last success.
    consecutive_failures: AtomicU32,
    /// Epoch seconds when the circuit last tripped open (0 = never).
    tripped_at: AtomicU64,
    /// Epoch seconds of the most recent recorded failure (0 = never).
    last_failure_at: AtomicU64,
    /// Set while a half-open probe is in flight so concurrent callers keep
    /// failing fast instead of all probing at once.
    probe_in_flight: AtomicBool,
    threshold: u32,
    cooldown_secs: u64,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl CircuitBreaker {
    /// Create a new breaker.
    /// - `threshold`: consecutive failures before tripping (default 5)
    /// - `cooldown_secs`: seconds before probe calls are allowed (default 60)
    pub fn new(service: impl Into<String>, threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            service: service.into(),
            consecutive_failures: AtomicU32::new(0),
            tripped_at: AtomicU64::new(0),
            last_failure_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            threshold,
            cooldown_secs,
        }
    }

    /// The dependency this breaker guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state, derived from the counters.
    pub fn state(&self) -> BreakerState {
        if self.consecutive_failures.load(Ordering::Relaxed) < self.threshold {
            return BreakerState::Closed;
        }
        let tripped = self.tripped_at.load(Ordering::Relaxed);
        if epoch_secs().saturating_sub(tripped) < self.cooldown_secs {
            BreakerState::Open
        } else {
            BreakerState::HalfOpen
        }
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Epoch seconds of the most recent failure, if any.
    pub fn last_failure_time(&self) -> Option<u64> {
        match self.last_failure_at.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    /// Check whether a call may proceed. Returns `CircuitOpen` while the
    /// cooldown is active, and admits exactly one probe in half-open.
    pub fn check(&self) -> EngineResult<()> {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.threshold {
            return Ok(());
        }

        let tripped = self.tripped_at.load(Ordering::Relaxed);
        let elapsed = epoch_secs().saturating_sub(tripped);
        if elapsed < self.cooldown_secs {
            return Err(EngineError::CircuitOpen {
                service: self.service.clone(),
                retry_in_secs: self.cooldown_secs - elapsed,
            });
        }

        // Half-open: first caller wins the probe slot, the rest fail fast.
        if self.probe_in_flight.swap(true, Ordering::AcqRel) {
            return Err(EngineError::CircuitOpen {
                service: self.service.clone(),
                retry_in_secs: 1,
            });
        }
        Ok(())
    }

    /// Record a successful call — closes the circuit.
    pub fn record_success(&self) {
        let was_open = self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
        if was_open {
            info!("[breaker] {} recovered — circuit closed", self.service);
        }
    }

    /// Record a failed call. Trips the circuit at the threshold; in
    /// half-open, re-trips and refreshes the cooldown window.
    pub fn record_failure(&self) {
        self.last_failure_at.store(epoch_secs(), Ordering::Relaxed);
        let prev = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
        if prev + 1 >= self.threshold {
            self.tripped_at.store(epoch_secs(), Ordering::Relaxed);
            warn!(
                "[breaker] {} tripped after {} consecutive failures — cooling down {}s",
                self.service,
                prev + 1,
                self.cooldown_secs
            );
        }
    }

    /// Manual reset back to closed. Test and operator use only.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.tripped_at.store(0, Ordering::Relaxed);
        self.last_failure_at.store(0, Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::Release);
    }

    /// Run `f` under the breaker: fail fast while open, otherwise execute and
    /// record the outcome.
    pub async fn guard<T, Fut>(&self, f: Fut) -> EngineResult<T>
    where
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        self.check()?;
        match f.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Named breaker table. One per engine; telemetry enumerates it, tests call
/// `reset_all`.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the breaker for a named dependency.
    pub fn get(&self, service: &str, threshold: u32, cooldown_secs: u64) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock();
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, threshold, cooldown_secs)))
            .clone()
    }

    /// Snapshot of `(service, state, failure_count, last_failure_time)` rows.
    pub fn snapshot(&self) -> Vec<(String, BreakerState, u32, Option<u64>)> {
        let map = self.breakers.lock();
        let mut rows: Vec<_> = map
            .values()
            .map(|b| (b.service().to_string(), b.state(), b.failure_count(), b.last_failure_time()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for b in self.breakers.lock().values() {
            b.reset();
        }
    }
}
