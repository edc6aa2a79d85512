// ── Mnemo Atoms: Domain Types ──────────────────────────────────────────────
//
// Type definitions for the memory substrate. These are pure data types
// (no logic beyond trivial constructors, no DB access, no I/O).
//
// Follows the project pattern: structs in atoms/, impls in engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Core entities
// ═══════════════════════════════════════════════════════════════════════════

/// The atomic memory unit: content, hash, optional enrichment, timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Surrogate id (SQLite rowid).
    pub id: i64,
    pub content: String,
    /// SHA-256 of `content`, hex-encoded. Functional key: identical content
    /// deduplicates to the same row.
    pub content_hash: String,
    /// Dense vector, zero-padded to the configured dimension. None until the
    /// enrichment pipeline has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Dimensions the provider actually produced (before padding). Stored so
    /// re-embedding can detect model drift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimension: Option<usize>,
    /// Token estimate from the token counter. Immutable after creation.
    pub token_count: usize,
    /// Free-form JSON-serializable key/value map.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Atomic factoid derived from a source node (see `metadata.source_node_id`).
    #[serde(default)]
    pub is_proposition: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone. A soft-deleted node is excluded from every default query path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    /// True if the node is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A hierarchical topic label: lowercase `[a-z0-9-]+` segments joined by `:`,
/// one to five levels deep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

/// Parsed shape of a hierarchical tag name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagHierarchy {
    /// The full name as given (`"devops:kubernetes:pods"`).
    pub full: String,
    /// First segment (`"devops"`).
    pub root: String,
    /// Everything above the leaf, or None for a root tag.
    pub parent: Option<String>,
    /// Individual segments, shallow to deep.
    pub levels: Vec<String>,
    /// Number of segments (1–5).
    pub depth: usize,
}

/// An agent identity that owns writes, recalls, and a working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Robot {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Robot ↔ node association. The `working_memory` flag is the canonical
/// source of working-set membership; `access_count` / `last_accessed_at`
/// feed the LFU+LRU eviction score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAssociation {
    pub robot_id: i64,
    pub node_id: i64,
    pub working_memory: bool,
    pub access_count: u32,
    pub last_accessed_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Write results
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of a long-term write. `is_new == false` means the content hash
/// matched an existing row — the caller must not schedule enrichment again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub node_id: i64,
    pub is_new: bool,
    pub token_count: usize,
}

/// Summary of one enrichment workflow run (save → embed ∥ tag ∥ propose →
/// finalize). Step 2–4 failures are recorded here, never propagated.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentReport {
    pub node_id: i64,
    pub is_new: bool,
    pub embedded: bool,
    pub tags_added: Vec<String>,
    pub propositions_created: Vec<i64>,
    /// Human-readable notes for skipped/failed steps.
    pub warnings: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Recall
// ═══════════════════════════════════════════════════════════════════════════

/// Which retriever produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallSource {
    Vector,
    Fulltext,
    Tags,
}

/// Recall strategy selector for the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecallStrategy {
    #[default]
    Hybrid,
    Vector,
    Fulltext,
}

impl RecallStrategy {
    /// Parse from the closed string set used at API boundaries.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hybrid" => Some(Self::Hybrid),
            "vector" => Some(Self::Vector),
            "fulltext" => Some(Self::Fulltext),
            _ => None,
        }
    }
}

/// One fused recall result with full scoring provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallHit {
    pub node_id: i64,
    pub content: String,
    /// Σ 1/(k + rank) over the retrievers that found this node.
    pub rrf_score: f64,
    /// Exactly the subset of retrievers that returned the node.
    pub sources: Vec<RecallSource>,
    pub vector_rank: Option<usize>,
    pub fulltext_rank: Option<usize>,
    pub tag_rank: Option<usize>,
    /// Cosine similarity ∈ [0,1], min-max normalized across the vector set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Lexical rank score (positive), min-max normalized across the FTS set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_rank: Option<f64>,
    /// Hierarchical tag-depth score ∈ [0, 1.1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_depth_score: Option<f64>,
    #[serde(default)]
    pub matched_tags: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Working memory
// ═══════════════════════════════════════════════════════════════════════════

/// One working-memory entry. Keyed by node id; `tokens` is the immutable
/// token cost accounted against the robot's budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingEntry {
    pub node_id: i64,
    pub content: String,
    pub tokens: usize,
    pub access_count: u32,
    /// Importance ∈ [0.0, 10.0]; defaults to 1.0. Used by the `balanced`
    /// context-assembly strategy.
    pub importance: f64,
    pub inserted_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// True when the entry was pulled in by a recall rather than a write.
    #[serde(default)]
    pub from_recall: bool,
}

/// Context-assembly ordering for `create_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextStrategy {
    #[default]
    Recent,
    Frequent,
    Balanced,
}

impl ContextStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recent" => Some(Self::Recent),
            "frequent" => Some(Self::Frequent),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 5: Change channel events
// ═══════════════════════════════════════════════════════════════════════════

/// Working-set membership change, propagated to every subscriber of a
/// group's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Evicted,
    Cleared,
}

/// The wire payload on the change channel. Kept small: ids only, receivers
/// fetch what they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    pub robot_id: i64,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 6: Timeframes
// ═══════════════════════════════════════════════════════════════════════════

/// A half-open interval `[start, end)` used as a retrieval filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeFrame {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// True if `t` falls inside `[start, end)`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Result of natural-language timeframe extraction: the query with the time
/// phrase stripped, the phrase itself, and the window it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframeExtraction {
    pub query: String,
    pub timeframe: Option<TimeFrame>,
    pub extracted: Option<String>,
}

/// Which weekday starts the week — affects "last week" and weekend math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    Sunday,
    #[default]
    Monday,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 7: Group / status reporting
// ═══════════════════════════════════════════════════════════════════════════

/// Snapshot of a robot group's membership and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub active: Vec<String>,
    pub passive: Vec<String>,
    /// Distinct working-memory nodes across all members.
    pub node_count: usize,
    /// Token total over those distinct nodes.
    pub token_count: usize,
    pub max_tokens: usize,
    /// token_count / max_tokens, clamped to [0, 1].
    pub utilization: f64,
    pub in_sync: bool,
}

/// Result of a whole-group synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced_nodes: usize,
    pub members_updated: usize,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub nodes: u64,
    pub embedded_nodes: u64,
    pub propositions: u64,
    pub tombstoned: u64,
    pub tags: u64,
    pub robots: u64,
}
