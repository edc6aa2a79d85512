// Mnemo — a durable, queryable memory substrate for LLM-driven agents.
//
// Two tiers: every robot owns a bounded, token-accounted working set of
// recently used memories; all robots share an append-dominant long-term
// store of every node ever written. Writes are enriched asynchronously
// (embedding, hierarchical tags, propositions) behind circuit breakers;
// reads fuse vector, full-text, and tag retrieval with Reciprocal Rank
// Fusion. Robot groups share a working set over an in-process change
// channel with failover.
//
// Layering:
//   atoms/   — constants, domain types, the error enum (pure, no I/O)
//   engine/  — store, retrieval, enrichment, groups, providers, telemetry
//
// Quick start:
//
// ```no_run
// use mnemo::{Engine, EngineConfig, JobRunner, RecallOptions};
// use mnemo::providers::HttpEmbeddingClient;
// use std::sync::Arc;
//
// # async fn demo() -> mnemo::EngineResult<()> {
// let engine = Engine::builder()
//     .config(EngineConfig::default())
//     .embedding(Arc::new(HttpEmbeddingClient::new(
//         "http://localhost:11434",
//         "nomic-embed-text",
//     )))
//     .jobs(JobRunner::task())
//     .build()?;
//
// let agent = engine.agent("athena")?;
// agent.remember("PostgreSQL uses MVCC for concurrency", &[], &Default::default()).await?;
// let hits = agent.recall("how does postgres handle concurrency", RecallOptions::default()).await?;
// # let _ = hits;
// # Ok(())
// # }
// ```

pub mod atoms;
pub mod engine;

// ── Public surface re-exports ──────────────────────────────────────────────

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    ChangeEvent, ChangeKind, ContextStrategy, EnrichmentReport, GroupStatus, Node,
    NodeAssociation, RecallHit, RecallSource, RecallStrategy, Robot, SaveOutcome, StoreStats,
    SyncReport, Tag, TagHierarchy, TimeFrame, TimeframeExtraction, WeekStart, WorkingEntry,
};
pub use engine::agent::{Agent, Engine, EngineBuilder, RecallOptions};
pub use engine::breaker::{BreakerState, CircuitBreaker};
pub use engine::config::EngineConfig;
pub use engine::jobs::{JobQueue, JobRunner};
pub use engine::providers;
pub use engine::robot_group::RobotGroup;
pub use engine::telemetry::{HealthReport, PoolStatus};
pub use engine::timeframe::{TimeframeParser, TimeframeValue};
pub use engine::tokenizer::{Tokenizer, TokenizerKind};
pub use engine::working_memory::WorkingMemory;
