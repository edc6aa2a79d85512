// ── Mnemo Engine: Enrichment Pipeline ───────────────────────────────────────
//
// Post-save asynchronous enrichment, a small fixed DAG:
//
//   1. save_node                 — persist + dedup (errors surface to caller)
//   2. generate_embedding  ┐
//   3. generate_tags       ├ run in parallel via the job runner's fan-out
//   4. generate_propositions ┘
//   5. finalize                  — working-memory placement + event publish
//                                  (owned by the agent facade)
//
// Steps 2–4 are best-effort: a failure is recorded as a warning on the
// report and logged, never propagated — the node stays usable without that
// signal. Dedup hits (`is_new == false`) schedule no enrichment at all.

use crate::atoms::constants::{PROPOSITION_MIN_CHARS, PROPOSITION_MIN_WORDS, TAG_ONTOLOGY_SAMPLE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{EnrichmentReport, SaveOutcome};
use crate::engine::breaker::BreakerRegistry;
use crate::engine::jobs::{JobFuture, JobRunner};
use crate::engine::providers::{EmbeddingProvider, PropositionProvider, TagProvider};
use crate::engine::store::MemoryStore;
use crate::engine::tags::TagEngine;
use crate::engine::tokenizer::Tokenizer;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// The enrichment side of a write. Cheap to clone: every field is shared.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    store: Arc<MemoryStore>,
    tag_engine: TagEngine,
    tokenizer: Tokenizer,
    embedding: Option<Arc<dyn EmbeddingProvider>>,
    tag_provider: Option<Arc<dyn TagProvider>>,
    proposition_provider: Option<Arc<dyn PropositionProvider>>,
    breakers: Arc<BreakerRegistry>,
    jobs: JobRunner,
    embedding_dimension: usize,
    breaker_threshold: u32,
    breaker_cooldown_secs: u64,
}

impl EnrichmentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MemoryStore>,
        tag_engine: TagEngine,
        tokenizer: Tokenizer,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
        tag_provider: Option<Arc<dyn TagProvider>>,
        proposition_provider: Option<Arc<dyn PropositionProvider>>,
        breakers: Arc<BreakerRegistry>,
        jobs: JobRunner,
        embedding_dimension: usize,
        breaker_threshold: u32,
        breaker_cooldown_secs: u64,
    ) -> Self {
        Self {
            store,
            tag_engine,
            tokenizer,
            embedding,
            tag_provider,
            proposition_provider,
            breakers,
            jobs,
            embedding_dimension,
            breaker_threshold,
            breaker_cooldown_secs,
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Step 1: persist the node. The only step whose error reaches the
    /// caller.
    pub fn save(
        &self,
        content: &str,
        metadata: &HashMap<String, serde_json::Value>,
        is_proposition: bool,
    ) -> EngineResult<SaveOutcome> {
        let tokens = self.tokenizer.count(content);
        self.store.save_node(content, tokens, metadata, is_proposition)
    }

    /// Steps 2–4, fanned out through the job runner and joined. Returns the
    /// report; individual failures are warnings, not errors.
    pub async fn enrich(&self, node_id: i64, robot_id: Option<i64>) -> EnrichmentReport {
        let report = Arc::new(Mutex::new(EnrichmentReport {
            node_id,
            is_new: true,
            ..Default::default()
        }));

        let jobs: Vec<(&'static str, JobFuture)> = vec![
            ("generate_embedding", {
                let this = self.clone();
                let report = report.clone();
                Box::pin(async move {
                    this.step_embedding(node_id, &report).await;
                    Ok(())
                })
            }),
            ("generate_tags", {
                let this = self.clone();
                let report = report.clone();
                Box::pin(async move {
                    this.step_tags(node_id, &report).await;
                    Ok(())
                })
            }),
            ("generate_propositions", {
                let this = self.clone();
                let report = report.clone();
                Box::pin(async move {
                    this.step_propositions(node_id, robot_id, &report).await;
                    Ok(())
                })
            }),
        ];

        self.jobs.join_parallel(jobs).await;

        let out = report.lock().clone();
        debug!(
            "[enrichment] node {}: embedded={} tags={} propositions={} warnings={}",
            node_id,
            out.embedded,
            out.tags_added.len(),
            out.propositions_created.len(),
            out.warnings.len()
        );
        out
    }

    // ── Step 2: embedding ───────────────────────────────────────────────

    async fn step_embedding(&self, node_id: i64, report: &Mutex<EnrichmentReport>) {
        let Some(provider) = &self.embedding else {
            return;
        };
        let node = match self.store.get_node(node_id) {
            Ok(Some(node)) => node,
            _ => {
                warn!("[enrichment] embedding skipped: node {node_id} missing");
                return;
            }
        };
        // Idempotent: re-running enrichment must not re-bill the provider.
        if node.embedding.is_some() {
            report.lock().embedded = true;
            return;
        }

        let breaker =
            self.breakers.get("embedding", self.breaker_threshold, self.breaker_cooldown_secs);
        let vector = match breaker.guard(provider.embed(&node.content)).await {
            Ok(v) => v,
            Err(e) => {
                let e = provider_error("embedding", e);
                warn!("[enrichment] embedding failed for node {node_id}: {e}");
                report.lock().warnings.push(format!("embedding: {e}"));
                return;
            }
        };

        if vector.len() > self.embedding_dimension {
            let msg = format!(
                "provider returned {} dimensions, store is fixed at {}",
                vector.len(),
                self.embedding_dimension
            );
            warn!("[enrichment] embedding rejected for node {node_id}: {msg}");
            report.lock().warnings.push(format!("embedding: {msg}"));
            return;
        }

        match self.store.set_embedding(node_id, &vector, self.embedding_dimension) {
            Ok(()) => report.lock().embedded = true,
            Err(e) => {
                warn!("[enrichment] embedding write failed for node {node_id}: {e}");
                report.lock().warnings.push(format!("embedding: {e}"));
            }
        }
    }

    // ── Step 3: tags ────────────────────────────────────────────────────

    async fn step_tags(&self, node_id: i64, report: &Mutex<EnrichmentReport>) {
        let Some(provider) = &self.tag_provider else {
            return;
        };
        let node = match self.store.get_node(node_id) {
            Ok(Some(node)) => node,
            _ => {
                warn!("[enrichment] tags skipped: node {node_id} missing");
                return;
            }
        };
        // Propositions inherit their topic from the source node; extracting
        // tags for each factoid would flood the ontology.
        if node.is_proposition {
            return;
        }

        let sample = self.store.sample_tag_names(TAG_ONTOLOGY_SAMPLE).unwrap_or_default();
        let breaker = self.breakers.get("tags", self.breaker_threshold, self.breaker_cooldown_secs);
        let proposed = match breaker.guard(provider.extract_tags(&node.content, &sample)).await {
            Ok(names) => names,
            Err(e) => {
                let e = provider_error("tags", e);
                warn!("[enrichment] tag extraction failed for node {node_id}: {e}");
                report.lock().warnings.push(format!("tags: {e}"));
                return;
            }
        };

        match self.tag_engine.add_tags_to_node(node_id, &proposed) {
            Ok((applied, skipped)) => {
                if !skipped.is_empty() {
                    debug!(
                        "[enrichment] node {node_id}: provider proposed {} invalid tags",
                        skipped.len()
                    );
                }
                report.lock().tags_added = applied;
            }
            Err(e) => {
                warn!("[enrichment] tag write failed for node {node_id}: {e}");
                report.lock().warnings.push(format!("tags: {e}"));
            }
        }
    }

    // ── Step 4: propositions ────────────────────────────────────────────

    async fn step_propositions(
        &self,
        node_id: i64,
        robot_id: Option<i64>,
        report: &Mutex<EnrichmentReport>,
    ) {
        let Some(provider) = &self.proposition_provider else {
            return;
        };
        let node = match self.store.get_node(node_id) {
            Ok(Some(node)) => node,
            _ => {
                warn!("[enrichment] propositions skipped: node {node_id} missing");
                return;
            }
        };
        if node.is_proposition {
            return;
        }

        let breaker = self
            .breakers
            .get("propositions", self.breaker_threshold, self.breaker_cooldown_secs);
        let raw = match breaker.guard(provider.extract_propositions(&node.content)).await {
            Ok(list) => list,
            Err(e) => {
                let e = provider_error("propositions", e);
                warn!("[enrichment] proposition extraction failed for node {node_id}: {e}");
                report.lock().warnings.push(format!("propositions: {e}"));
                return;
            }
        };

        for proposition in filter_propositions(&raw) {
            let mut metadata = HashMap::new();
            metadata.insert("source_node_id".to_string(), json!(node_id));
            match self.save(&proposition, &metadata, true) {
                Ok(outcome) => {
                    if let Some(robot_id) = robot_id {
                        self.store.associate_node(robot_id, outcome.node_id).ok();
                    }
                    if outcome.is_new {
                        report.lock().propositions_created.push(outcome.node_id);
                    }
                }
                Err(e) => {
                    warn!("[enrichment] proposition write failed for node {node_id}: {e}");
                    report.lock().warnings.push(format!("propositions: {e}"));
                }
            }
        }
    }
}

/// Keep propositions that look like standalone factual sentences: long
/// enough, word-y enough, actually textual, and not repeated in the batch.
pub fn filter_propositions(raw: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for p in raw {
        let p = p.trim();
        if p.len() < PROPOSITION_MIN_CHARS {
            continue;
        }
        if p.split_whitespace().count() < PROPOSITION_MIN_WORDS {
            continue;
        }
        if !p.chars().any(|c| c.is_alphabetic()) {
            continue;
        }
        if !seen.insert(p.to_lowercase()) {
            continue;
        }
        out.push(p.to_string());
    }
    out
}

/// Map a breaker fail-fast onto the provider's error kind, per the
/// propagation policy.
fn provider_error(service: &str, e: EngineError) -> EngineError {
    match e {
        EngineError::CircuitOpen { service: s, retry_in_secs } => {
            let msg = format!("circuit open for {s}, retry in {retry_in_secs}s");
            match service {
                "embedding" => EngineError::Embedding(msg),
                "tags" => EngineError::Tag(msg),
                _ => EngineError::Proposition(msg),
            }
        }
        other => other,
    }
}
