// Integration tests — full write → enrich → recall → group flows over an
// in-memory store with deterministic fake providers and the inline job
// backend (everything completes before the call returns).

use mnemo::engine::store::content_hash;
use mnemo::providers::{FnEmbedding, FnPropositions, FnTags};
use mnemo::{
    Engine, EngineConfig, EngineError, JobRunner, RecallOptions, RecallSource, RecallStrategy,
    RobotGroup, TimeFrame, TimeframeValue, Tokenizer,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Deterministic embedding: axis 0 lights up for database-ish text, axis 1
/// for everything else, so cosine ordering is predictable.
fn fake_embedding(calls: Arc<AtomicU32>) -> Arc<FnEmbedding> {
    Arc::new(FnEmbedding::new(move |text| {
        calls.fetch_add(1, Ordering::SeqCst);
        let t = text.to_lowercase();
        let db = t.contains("postgres") || t.contains("database");
        Ok(if db { vec![1.0, 0.1] } else { vec![0.1, 1.0] })
    }))
}

/// Deterministic tag extraction keyed on marker words.
fn fake_tags() -> Arc<FnTags> {
    Arc::new(FnTags::new(|text, _sample| {
        let t = text.to_lowercase();
        let mut tags = Vec::new();
        if t.contains("postgres") {
            tags.push("databases:postgres".to_string());
        }
        if t.contains("kubernetes") {
            tags.push("devops:kubernetes".to_string());
        }
        Ok(tags)
    }))
}

fn fake_propositions() -> Arc<FnPropositions> {
    Arc::new(FnPropositions::new(|text| {
        Ok(vec![format!("The note says that {}", text.to_lowercase())])
    }))
}

struct TestBed {
    engine: Arc<Engine>,
    embed_calls: Arc<AtomicU32>,
}

fn bed() -> TestBed {
    bed_with(Tokenizer::heuristic(), 8192)
}

fn bed_with(tokenizer: Tokenizer, default_max_tokens: usize) -> TestBed {
    let embed_calls = Arc::new(AtomicU32::new(0));
    let engine = Engine::builder()
        .config(EngineConfig {
            db_path: PathBuf::from(":memory:"),
            embedding_dimension: 2,
            default_max_tokens,
            ..Default::default()
        })
        .tokenizer(tokenizer)
        .jobs(JobRunner::inline())
        .embedding(fake_embedding(embed_calls.clone()))
        .tag_provider(fake_tags())
        .proposition_provider(fake_propositions())
        .build()
        .unwrap();
    TestBed { engine, embed_calls }
}

fn no_meta() -> HashMap<String, serde_json::Value> {
    HashMap::new()
}

// ═══════════════════════════════════════════════════════════════════════════
// S1 — write dedup
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn write_dedup_returns_same_node_without_reenrichment() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();

    let first = agent.remember("Ruby is an interpreted language", &[], &no_meta()).await.unwrap();
    let calls_after_first = bed.embed_calls.load(Ordering::SeqCst);
    let second = agent.remember("Ruby is an interpreted language", &[], &no_meta()).await.unwrap();

    assert_eq!(first, second);
    // No enrichment jobs on the dedup write: embedding was not called again.
    assert_eq!(bed.embed_calls.load(Ordering::SeqCst), calls_after_first);

    // One row bearing that content hash.
    let node = agent.retrieve(first).unwrap();
    assert_eq!(node.content_hash, content_hash("Ruby is an interpreted language"));
    let stats = bed.engine.stats().unwrap();
    // The write plus its extracted proposition.
    assert_eq!(stats.nodes, 2);
    assert_eq!(stats.propositions, 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// S2 — parent-tag expansion
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn parent_tags_materialize_with_the_leaf() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent.remember("pod scheduling notes", &[], &no_meta()).await.unwrap();

    agent.add_tag(node_id, "devops:kubernetes:pods").unwrap();

    let names = bed.engine.store().tags_for_node(node_id).unwrap();
    assert_eq!(
        names,
        vec![
            "devops".to_string(),
            "devops:kubernetes".to_string(),
            "devops:kubernetes:pods".to_string(),
        ]
    );
}

#[tokio::test]
async fn shared_ancestors_are_applied_once() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent
        .remember(
            "cluster services",
            &["devops:kubernetes:pods".into(), "devops:kubernetes:services".into()],
            &no_meta(),
        )
        .await
        .unwrap();

    let names = bed.engine.store().tags_for_node(node_id).unwrap();
    assert_eq!(names.iter().filter(|n| n.as_str() == "devops").count(), 1);
    assert!(names.contains(&"devops:kubernetes:pods".to_string()));
    assert!(names.contains(&"devops:kubernetes:services".to_string()));
}

// ═══════════════════════════════════════════════════════════════════════════
// S3 — soft vs hard delete
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn soft_delete_hides_hard_delete_removes_restore_revives() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent
        .remember("postgres vacuum removes dead tuples", &[], &no_meta())
        .await
        .unwrap();

    // Soft delete: hidden from retrieval paths, visible as a tombstone.
    agent.forget(node_id, true, None).unwrap();
    assert!(matches!(agent.retrieve(node_id), Err(EngineError::NotFound { .. })));
    let hits = agent.recall("postgres vacuum", RecallOptions::default()).await.unwrap();
    assert!(hits.iter().all(|h| h.node_id != node_id));
    assert!(bed.engine.tombstoned().unwrap().iter().any(|n| n.id == node_id));

    // Restore keeps the id and revives retrieval.
    agent.restore(node_id).unwrap();
    assert_eq!(agent.retrieve(node_id).unwrap().id, node_id);
    let hits = agent.recall("postgres vacuum", RecallOptions::default()).await.unwrap();
    assert!(hits.iter().any(|h| h.node_id == node_id));

    // Hard delete demands the confirmation token.
    let err = agent.forget(node_id, false, None).unwrap_err();
    assert!(err.is_validation());
    agent.forget(node_id, false, Some("confirmed")).unwrap();
    assert!(bed.engine.tombstoned().unwrap().is_empty());
    assert!(matches!(agent.retrieve(node_id), Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn purge_deleted_requires_confirmation() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent.remember("expendable note", &[], &no_meta()).await.unwrap();
    agent.forget(node_id, true, None).unwrap();

    assert!(bed.engine.purge_deleted(chrono::Duration::zero(), None).is_err());
    let purged = bed.engine.purge_deleted(chrono::Duration::zero(), Some("confirmed")).unwrap();
    assert_eq!(purged, 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// S4 — hybrid recall with all three sources
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn hybrid_recall_fuses_vector_fulltext_and_tags() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();

    let target = agent
        .remember("postgres stores relational data on disk", &[], &no_meta())
        .await
        .unwrap();
    agent
        .remember("gardening tips for growing tomatoes", &[], &no_meta())
        .await
        .unwrap();

    let hits = agent.recall("postgres data", RecallOptions::default()).await.unwrap();
    assert!(!hits.is_empty());

    let top = &hits[0];
    assert_eq!(top.node_id, target);
    assert!(top.sources.contains(&RecallSource::Vector));
    assert!(top.sources.contains(&RecallSource::Fulltext));
    assert!(top.sources.contains(&RecallSource::Tags));
    assert!(top.matched_tags.contains(&"databases:postgres".to_string()));
    assert!(top.similarity.is_some());
    assert!(top.text_rank.is_some());
    assert!(top.tag_depth_score.is_some());

    // The triple-source node outranks every single-source one.
    for other in &hits[1..] {
        assert!(other.rrf_score < top.rrf_score);
    }
}

#[tokio::test]
async fn single_retriever_strategies() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent
        .remember("postgres replication uses write-ahead logs", &[], &no_meta())
        .await
        .unwrap();

    let vector_only = agent
        .recall(
            "postgres replication",
            RecallOptions { strategy: RecallStrategy::Vector, ..Default::default() },
        )
        .await
        .unwrap();
    assert!(vector_only.iter().any(|h| h.node_id == node_id));
    assert!(vector_only.iter().all(|h| h.sources == vec![RecallSource::Vector]));

    let fulltext_only = agent
        .recall(
            "postgres replication",
            RecallOptions { strategy: RecallStrategy::Fulltext, ..Default::default() },
        )
        .await
        .unwrap();
    assert!(fulltext_only.iter().any(|h| h.node_id == node_id));
    assert!(fulltext_only.iter().all(|h| h.sources == vec![RecallSource::Fulltext]));
}

#[tokio::test]
async fn recall_with_no_results_returns_empty() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let hits = agent.recall("anything at all", RecallOptions::default()).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn repeated_recall_hits_the_query_cache() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    agent.remember("postgres connection pooling", &[], &no_meta()).await.unwrap();

    let first = agent.recall("postgres pooling", RecallOptions::default()).await.unwrap();
    let second = agent.recall("postgres pooling", RecallOptions::default()).await.unwrap();
    assert_eq!(
        first.iter().map(|h| h.node_id).collect::<Vec<_>>(),
        second.iter().map(|h| h.node_id).collect::<Vec<_>>()
    );
    assert!(bed.engine.health().cache.hits >= 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// S5 — working-memory eviction
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn eviction_keeps_working_set_within_budget() {
    // Fixed-cost tokenizer: every memory is 40 tokens, budget fits two.
    let bed = bed_with(Tokenizer::custom(|_| 40), 100);
    let agent = bed.engine.agent("athena").unwrap();

    let a = agent.remember("first topic alpha", &[], &no_meta()).await.unwrap();
    let b = agent.remember("second topic beta", &[], &no_meta()).await.unwrap();
    let c = agent.remember("third topic gamma", &[], &no_meta()).await.unwrap();

    // Budget respected, exactly one eviction.
    assert!(agent.working_tokens() <= 100);
    let working: Vec<i64> = agent.working_set().unwrap().iter().map(|(n, _)| n.id).collect();
    assert_eq!(working.len(), 2);
    assert!(working.contains(&c), "newest write always resident");

    // Long-term storage still holds all three.
    for id in [a, b, c] {
        assert_eq!(agent.retrieve(id).unwrap().id, id);
    }

    // The evicted association flag is cleared, not deleted.
    let evicted_id = [a, b].iter().copied().find(|id| !working.contains(id)).unwrap();
    let assoc = bed
        .engine
        .store()
        .get_association(agent.robot().id, evicted_id)
        .unwrap()
        .unwrap();
    assert!(!assoc.working_memory);
}

#[tokio::test]
async fn working_memory_rebuilds_from_the_store() {
    let bed = bed_with(Tokenizer::custom(|_| 10), 100);
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent.remember("durable working set entry", &[], &no_meta()).await.unwrap();
    assert!(agent.working_tokens() > 0);

    // A fresh handle for the same robot mirrors the canonical flags.
    let reborn = bed.engine.agent("athena").unwrap();
    assert_eq!(reborn.working_tokens(), 10);
    let ctx = reborn.create_context("recent", None).unwrap();
    assert!(ctx.contains("durable working set entry"));
    let _ = node_id;
}

#[tokio::test]
async fn create_context_strategies_and_validation() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    agent.remember("alpha memory for context", &[], &no_meta()).await.unwrap();
    agent.remember("beta memory for context", &[], &no_meta()).await.unwrap();

    for strategy in ["recent", "frequent", "balanced"] {
        let ctx = agent.create_context(strategy, None).unwrap();
        assert!(ctx.contains("alpha memory") && ctx.contains("beta memory"));
    }

    let err = agent.create_context("newest", None).unwrap_err();
    assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "strategy"));
}

// ═══════════════════════════════════════════════════════════════════════════
// S6 — group sync and failover
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn group_write_reaches_standby_and_failover_keeps_writing() {
    let bed = bed();
    let group = RobotGroup::new(bed.engine.clone(), "pair", 10_000).unwrap();
    group.add_active("A").unwrap();
    group.add_passive("S").unwrap();

    let node_id = group.remember("shared", &[], &no_meta(), None).await.unwrap();
    let standby = group.member("S").unwrap();
    assert!(bed
        .engine
        .store()
        .working_set_ids(standby.robot().id)
        .unwrap()
        .contains(&node_id));

    group.remove("A").unwrap();
    group.failover().unwrap();
    assert_eq!(group.active_names(), vec!["S"]);
    let second = group.remember("after failover", &[], &no_meta(), None).await.unwrap();
    assert!(second > 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// S7 — timeframe handling on recall
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn timeframe_phrases_filter_recall() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent
        .remember("we discussed postgres partitioning", &[], &no_meta())
        .await
        .unwrap();

    // The phrase is stripped before searching, so fresh nodes still match
    // "last week" (the window is [now-7d, now)).
    let hits = agent
        .recall("what did we discuss last week about postgres", RecallOptions::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.node_id == node_id));

    // An explicit window in the past excludes nodes written just now.
    let past = TimeFrame::new(
        chrono::Utc::now() - chrono::Duration::days(14),
        chrono::Utc::now() - chrono::Duration::days(7),
    );
    let hits = agent
        .recall(
            "postgres partitioning",
            RecallOptions { timeframe: Some(TimeframeValue::Range(past)), ..Default::default() },
        )
        .await
        .unwrap();
    assert!(hits.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Enrichment side effects
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn writes_are_enriched_with_embedding_tags_and_propositions() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent
        .remember("postgres indexes speed up query planning", &[], &no_meta())
        .await
        .unwrap();

    let node = agent.retrieve(node_id).unwrap();
    let embedding = node.embedding.unwrap();
    assert_eq!(embedding.len(), 2);
    assert_eq!(node.embedding_dimension, Some(2));

    let tags = bed.engine.store().tags_for_node(node_id).unwrap();
    assert!(tags.contains(&"databases".to_string()));
    assert!(tags.contains(&"databases:postgres".to_string()));

    let stats = bed.engine.stats().unwrap();
    assert_eq!(stats.propositions, 1);

    // The proposition links back to its source.
    let tombstone_free = bed.engine.store();
    let all = stats.nodes;
    assert_eq!(all, 2);
    let prop_id = (1..=all as i64).find(|id| *id != node_id).unwrap();
    let prop = tombstone_free.get_node(prop_id).unwrap().unwrap();
    assert!(prop.is_proposition);
    assert_eq!(prop.metadata.get("source_node_id"), Some(&serde_json::json!(node_id)));
}

#[tokio::test]
async fn content_update_reenriches() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent.remember("kubernetes pod notes", &[], &no_meta()).await.unwrap();
    let before = agent.retrieve(node_id).unwrap();
    assert!(before.embedding.is_some());

    agent.update_content(node_id, "postgres tuning notes instead").await.unwrap();

    let after = agent.retrieve(node_id).unwrap();
    assert_eq!(after.content, "postgres tuning notes instead");
    assert_eq!(after.id, node_id);
    // Re-embedded for the new content, and newly tagged for it too.
    assert!(after.embedding.is_some());
    let tags = bed.engine.store().tags_for_node(node_id).unwrap();
    assert!(tags.contains(&"databases:postgres".to_string()));
}

#[tokio::test]
async fn provider_failure_never_fails_the_write() {
    let engine = Engine::builder()
        .config(EngineConfig { db_path: PathBuf::from(":memory:"), ..Default::default() })
        .jobs(JobRunner::inline())
        .embedding(Arc::new(FnEmbedding::new(|_| {
            Err(EngineError::Embedding("provider down".into()))
        })))
        .build()
        .unwrap();
    let agent = engine.agent("athena").unwrap();

    let node_id = agent.remember("still persisted", &[], &no_meta()).await.unwrap();
    let node = agent.retrieve(node_id).unwrap();
    assert!(node.embedding.is_none());
}

#[tokio::test]
async fn breaker_opens_after_repeated_provider_failures() {
    let engine = Engine::builder()
        .config(EngineConfig {
            db_path: PathBuf::from(":memory:"),
            breaker_threshold: 2,
            ..Default::default()
        })
        .jobs(JobRunner::inline())
        .embedding(Arc::new(FnEmbedding::new(|_| {
            Err(EngineError::Embedding("provider down".into()))
        })))
        .build()
        .unwrap();
    let agent = engine.agent("athena").unwrap();

    agent.remember("failing write one", &[], &no_meta()).await.unwrap();
    agent.remember("failing write two", &[], &no_meta()).await.unwrap();

    let health = engine.health();
    assert!(!health.healthy);
    assert!(health.issues.iter().any(|i| i.contains("embedding")));
    assert!(health
        .breakers
        .iter()
        .any(|b| b.service == "embedding" && b.state == "open" && b.failure_count >= 2));
}

// ═══════════════════════════════════════════════════════════════════════════
// Validation at the facade
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn facade_validates_inputs() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();

    assert!(agent.remember("", &[], &no_meta()).await.unwrap_err().is_validation());

    let mut bad = HashMap::new();
    bad.insert("importance".to_string(), serde_json::json!(42));
    assert!(agent.remember("text", &[], &bad).await.unwrap_err().is_validation());

    let err = agent
        .recall("q", RecallOptions { limit: Some(0), ..Default::default() })
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert!(agent.add_tag(999_999, "devops").is_err());
}

// ═══════════════════════════════════════════════════════════════════════════
// Tag search surface
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tag_fuzzy_and_prefix_search() {
    let bed = bed();
    let agent = bed.engine.agent("athena").unwrap();
    let node_id = agent.remember("tagged note", &[], &no_meta()).await.unwrap();
    agent.add_tag(node_id, "devops:kubernetes:pods").unwrap();

    let fuzzy = bed.engine.tags().search_fuzzy("kubernets", None, 10).unwrap();
    assert!(fuzzy.iter().any(|(name, _)| name == "devops:kubernetes"));

    let prefixed = bed.engine.tags().search_prefix("devops:kubernetes").unwrap();
    assert_eq!(
        prefixed,
        vec!["devops:kubernetes".to_string(), "devops:kubernetes:pods".to_string()]
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Invariant 3 — budget holds across arbitrary write sequences
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn token_budget_invariant_holds_under_many_writes() {
    let bed = bed_with(Tokenizer::custom(|t| t.len()), 120);
    let agent = bed.engine.agent("athena").unwrap();

    for i in 0..20 {
        agent
            .remember(&format!("memory number {i} with some padding text"), &[], &no_meta())
            .await
            .unwrap();
        assert!(agent.working_tokens() <= 120, "budget exceeded at write {i}");
        let canonical: usize = agent
            .working_set()
            .unwrap()
            .iter()
            .map(|(n, _)| n.token_count)
            .sum();
        assert!(canonical <= 120, "canonical budget exceeded at write {i}");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// On-disk store smoke test
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn on_disk_store_survives_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.db");

    let build = |path: PathBuf| {
        Engine::builder()
            .config(EngineConfig { db_path: path, ..Default::default() })
            .jobs(JobRunner::inline())
            .build()
            .unwrap()
    };

    let node_id = {
        let engine = build(path.clone());
        let agent = engine.agent("athena").unwrap();
        agent.remember("persisted across restarts", &[], &no_meta()).await.unwrap()
    };

    let engine = build(path);
    let agent = engine.agent("athena").unwrap();
    assert_eq!(agent.retrieve(node_id).unwrap().content, "persisted across restarts");
    // The working set came back from robot_nodes flags.
    assert!(agent.working_tokens() > 0);
}
