// ── Mnemo Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Validation errors always name the offending field so callers can surface
//     structured messages without parsing strings.
//   • No variant carries secret material (API keys, endpoints with tokens).

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Bad input. Never retried; the field name is part of the contract.
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// A referenced entity does not exist (or is tombstoned on a default path).
    #[error("Not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    /// Embedding provider failure (wraps the underlying cause as text).
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Tag extraction provider failure.
    #[error("Tag error: {0}")]
    Tag(String),

    /// Proposition extraction provider failure.
    #[error("Proposition error: {0}")]
    Proposition(String),

    /// Fail-fast signal from a circuit breaker guarding an external service.
    #[error("Circuit breaker open for {service}: retry in {retry_in_secs}s")]
    CircuitOpen { service: String, retry_in_secs: u64 },

    /// Engine configuration is invalid or missing. Raised at setup time only.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a validation error naming the offending field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Create a not-found error for an entity kind and id.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    /// True for validation failures — callers use this to decide against retrying.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

// ── Bridge: String → EngineError ───────────────────────────────────────────
// Lets provider clients build errors from formatted messages with `?`/`into()`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
/// At tool/IPC boundaries, convert with `.map_err(|e| e.to_string())`.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
