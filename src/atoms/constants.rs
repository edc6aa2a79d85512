// ── Mnemo Atoms: Constants ─────────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Content limits ─────────────────────────────────────────────────────────
// Enforced at the facade boundary before anything touches the store.
pub const MAX_CONTENT_BYTES: usize = 1_000_000;
pub const MAX_METADATA_KEY_CHARS: usize = 255;
pub const MAX_METADATA_VALUE_CHARS: usize = 1_000_000;
pub const MAX_ARRAY_ITEMS: usize = 1000;
pub const MIN_IMPORTANCE: f64 = 0.0;
pub const MAX_IMPORTANCE: f64 = 10.0;

// ── Embeddings ─────────────────────────────────────────────────────────────
// The store column is fixed-width; shorter provider vectors are zero-padded
// up to the configured dimension, which may never exceed this cap.
pub const MAX_EMBEDDING_DIMENSION: usize = 2000;

// ── Hybrid recall ──────────────────────────────────────────────────────────
// RRF constant (k = 60 is standard in information retrieval).
pub const RRF_K: f64 = 60.0;
// Per-retriever candidate cap before fusion.
pub const RETRIEVER_CANDIDATE_LIMIT: usize = 100;
// Bonus added to a node's tag-depth score when it matches ≥ 2 extracted
// tag chains, and the hard cap after the bonus.
pub const TAG_MULTI_CHAIN_BONUS: f64 = 0.05;
pub const TAG_DEPTH_SCORE_CAP: f64 = 1.1;
pub const TAG_MULTI_CHAIN_MIN: usize = 2;

// ── Tag ontology ───────────────────────────────────────────────────────────
pub const TAG_MAX_DEPTH: usize = 5;
// Default trigram similarity floor for fuzzy tag search.
pub const TAG_FUZZY_MIN_SIMILARITY: f64 = 0.3;
// How many existing tag names are sampled as context for the tag provider.
pub const TAG_ONTOLOGY_SAMPLE: usize = 50;

// ── Query cache ────────────────────────────────────────────────────────────
pub const QUERY_CACHE_TTL_SECS: u64 = 60;
pub const QUERY_CACHE_MAX_ENTRIES: usize = 100;

// ── Embedding cache ────────────────────────────────────────────────────────
// Process-local content-hash → vector cache so repeated query embeds skip
// the provider round-trip.
pub const EMBEDDING_CACHE_MAX_ENTRIES: usize = 256;

// ── Circuit breaker ────────────────────────────────────────────────────────
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_COOLDOWN_SECS: u64 = 60;

// ── Working memory ─────────────────────────────────────────────────────────
// Default per-robot token budget when the robot has no explicit limit.
pub const DEFAULT_MAX_TOKENS: usize = 8192;

// ── Proposition extraction filters ─────────────────────────────────────────
// A surviving proposition must clear all of these floors.
pub const PROPOSITION_MIN_CHARS: usize = 10;
pub const PROPOSITION_MIN_WORDS: usize = 5;

// ── Timeframe parsing ──────────────────────────────────────────────────────
// "a few" expands to this quantity ("few days ago" → 3 days ago).
pub const FEW_QUANTITY: i64 = 3;

// ── Change channel ─────────────────────────────────────────────────────────
// Prefix prepended to every sanitized channel name.
pub const CHANNEL_PREFIX: &str = "mnemo_";
// Broadcast buffer per channel; slow subscribers lag past this and are
// logged, not blocked.
pub const CHANNEL_CAPACITY: usize = 256;

// ── Telemetry ──────────────────────────────────────────────────────────────
pub const LATENCY_WINDOW: usize = 512;
pub const POOL_WARNING_UTILIZATION: f64 = 0.75;
pub const POOL_CRITICAL_UTILIZATION: f64 = 0.90;
