// ── Mnemo Engine: Configuration ─────────────────────────────────────────────
//
// Typed configuration for the substrate. Everything the environment used to
// decide is a field here; `validate()` runs once at engine build time and
// rejects bad setups with `Config` errors before any I/O happens.
//
// Providers, the tokenizer, and the job backend are injected separately on
// the engine builder — they are capabilities, not values.

use crate::atoms::constants::{
    BREAKER_COOLDOWN_SECS, BREAKER_FAILURE_THRESHOLD, DEFAULT_MAX_TOKENS,
    MAX_EMBEDDING_DIMENSION, QUERY_CACHE_MAX_ENTRIES, QUERY_CACHE_TTL_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::WeekStart;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database path; `:memory:` for an in-process store.
    pub db_path: PathBuf,
    /// Connection pool size (forced to 1 for in-memory stores).
    pub pool_size: usize,
    /// Fixed store width for embeddings; provider vectors are zero-padded
    /// up to this and rejected above it.
    pub embedding_dimension: usize,
    /// Working-memory token budget for robots without an explicit limit.
    pub default_max_tokens: usize,
    /// First day of the week for timeframe parsing.
    pub week_start: WeekStart,
    /// Query-result cache tuning.
    pub cache_ttl: Duration,
    pub cache_entries: usize,
    /// Circuit-breaker tuning, shared by all named breakers.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("mnemo.db"),
            pool_size: 4,
            embedding_dimension: 768,
            default_max_tokens: DEFAULT_MAX_TOKENS,
            week_start: WeekStart::default(),
            cache_ttl: Duration::from_secs(QUERY_CACHE_TTL_SECS),
            cache_entries: QUERY_CACHE_MAX_ENTRIES,
            breaker_threshold: BREAKER_FAILURE_THRESHOLD,
            breaker_cooldown_secs: BREAKER_COOLDOWN_SECS,
        }
    }
}

impl EngineConfig {
    /// True when the store lives in process memory (tests, scratch runs).
    pub fn in_memory(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }

    /// Startup-time validation. Every rejected field names itself.
    pub fn validate(&self) -> EngineResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(EngineError::Config("db_path must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(EngineError::Config("pool_size must be at least 1".into()));
        }
        if self.embedding_dimension == 0 || self.embedding_dimension > MAX_EMBEDDING_DIMENSION {
            return Err(EngineError::Config(format!(
                "embedding_dimension must be in 1..={MAX_EMBEDDING_DIMENSION}, got {}",
                self.embedding_dimension
            )));
        }
        if self.default_max_tokens == 0 {
            return Err(EngineError::Config("default_max_tokens must be at least 1".into()));
        }
        if self.cache_entries == 0 {
            return Err(EngineError::Config("cache_entries must be at least 1".into()));
        }
        if self.breaker_threshold == 0 {
            return Err(EngineError::Config("breaker_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_dimension() {
        let config = EngineConfig { embedding_dimension: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_dimension() {
        let config = EngineConfig { embedding_dimension: 2001, ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_path() {
        let config = EngineConfig { db_path: PathBuf::new(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_in_memory_detection() {
        let config = EngineConfig { db_path: PathBuf::from(":memory:"), ..Default::default() };
        assert!(config.in_memory());
        assert!(!EngineConfig::default().in_memory());
    }
}
