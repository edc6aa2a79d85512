// ── Mnemo Engine: Agent Facade ──────────────────────────────────────────────
//
// The primary public surface. An `Engine` owns the shared substrate (store,
// cache, bus, providers, telemetry); an `Agent` is one robot's handle onto
// it: remember / recall / forget / restore / retrieve / create_context.
//
// Write path: validate → save (errors surface) → associate + manual tags →
// enrichment fan-out via the job runner → finalize (working-memory placement,
// eviction flag clearing, robot activity, `added` event).
//
// Read path: timeframe extraction → hybrid search (cached) → access
// recording on the fused hits.
//
// All inputs are validated at this boundary with field-named errors; nothing
// below it re-checks.

use crate::atoms::constants::{
    MAX_ARRAY_ITEMS, MAX_CONTENT_BYTES, MAX_IMPORTANCE, MAX_METADATA_KEY_CHARS,
    MAX_METADATA_VALUE_CHARS, MIN_IMPORTANCE,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    ChangeEvent, ChangeKind, Node, NodeAssociation, RecallHit, RecallStrategy, Robot, StoreStats,
    TimeFrame,
};
use crate::engine::breaker::BreakerRegistry;
use crate::engine::change_bus::ChangeBus;
use crate::engine::config::EngineConfig;
use crate::engine::enrichment::EnrichmentPipeline;
use crate::engine::jobs::JobRunner;
use crate::engine::providers::{EmbeddingProvider, PropositionProvider, TagProvider};
use crate::engine::query_cache::QueryCache;
use crate::engine::recall::{EmbeddingCache, HybridSearch};
use crate::engine::store::MemoryStore;
use crate::engine::tags::TagEngine;
use crate::engine::telemetry::{HealthReport, Telemetry};
use crate::engine::timeframe::{TimeframeParser, TimeframeValue};
use crate::engine::tokenizer::Tokenizer;
use crate::engine::working_memory::WorkingMemory;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// The shared memory substrate. Construct once per process via
/// [`Engine::builder`], then mint one [`Agent`] per robot.
pub struct Engine {
    config: EngineConfig,
    store: Arc<MemoryStore>,
    tag_engine: TagEngine,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<QueryCache>,
    bus: Arc<ChangeBus>,
    telemetry: Arc<Telemetry>,
    jobs: JobRunner,
    search: HybridSearch,
    enrichment: EnrichmentPipeline,
    timeframes: TimeframeParser,
}

pub struct EngineBuilder {
    config: EngineConfig,
    tokenizer: Tokenizer,
    jobs: JobRunner,
    embedding: Option<Arc<dyn EmbeddingProvider>>,
    tag_provider: Option<Arc<dyn TagProvider>>,
    proposition_provider: Option<Arc<dyn PropositionProvider>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn jobs(mut self, jobs: JobRunner) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn embedding(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding = Some(provider);
        self
    }

    pub fn tag_provider(mut self, provider: Arc<dyn TagProvider>) -> Self {
        self.tag_provider = Some(provider);
        self
    }

    pub fn proposition_provider(mut self, provider: Arc<dyn PropositionProvider>) -> Self {
        self.proposition_provider = Some(provider);
        self
    }

    pub fn build(self) -> EngineResult<Arc<Engine>> {
        self.config.validate()?;

        let store = Arc::new(if self.config.in_memory() {
            MemoryStore::open_in_memory()?
        } else {
            MemoryStore::open_with_pool(&self.config.db_path, self.config.pool_size)?
        });

        let tag_engine = TagEngine::new(store.clone());
        let breakers = Arc::new(BreakerRegistry::new());
        let cache = Arc::new(QueryCache::new(self.config.cache_ttl, self.config.cache_entries));
        let embed_cache = Arc::new(EmbeddingCache::default());
        let telemetry = Arc::new(Telemetry::new());

        let search = HybridSearch::new(
            store.clone(),
            tag_engine.clone(),
            self.embedding.clone(),
            self.tag_provider.clone(),
            breakers.clone(),
            cache.clone(),
            embed_cache,
            telemetry.clone(),
            self.config.breaker_threshold,
            self.config.breaker_cooldown_secs,
        );

        let enrichment = EnrichmentPipeline::new(
            store.clone(),
            tag_engine.clone(),
            self.tokenizer,
            self.embedding,
            self.tag_provider,
            self.proposition_provider,
            breakers.clone(),
            self.jobs.clone(),
            self.config.embedding_dimension,
            self.config.breaker_threshold,
            self.config.breaker_cooldown_secs,
        );

        let timeframes = TimeframeParser::new(self.config.week_start);

        info!(
            "[engine] up: db={:?} pool={} jobs={} dim={}",
            self.config.db_path,
            if self.config.in_memory() { 1 } else { self.config.pool_size },
            self.jobs.backend_name(),
            self.config.embedding_dimension
        );

        Ok(Arc::new(Engine {
            config: self.config,
            store,
            tag_engine,
            breakers,
            cache,
            bus: Arc::new(ChangeBus::new()),
            telemetry,
            jobs: self.jobs,
            search,
            enrichment,
            timeframes,
        }))
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            tokenizer: Tokenizer::heuristic(),
            jobs: JobRunner::task(),
            embedding: None,
            tag_provider: None,
            proposition_provider: None,
        }
    }

    /// Mint an agent for a robot with the default token budget.
    pub fn agent(self: &Arc<Self>, robot_name: &str) -> EngineResult<Agent> {
        self.agent_with_budget(robot_name, self.config.default_max_tokens)
    }

    /// Mint an agent with an explicit working-memory token budget. The
    /// in-process working set is rebuilt from the canonical
    /// `robot_nodes.working_memory` flags.
    pub fn agent_with_budget(self: &Arc<Self>, robot_name: &str, max_tokens: usize) -> EngineResult<Agent> {
        if robot_name.is_empty() {
            return Err(EngineError::validation("robot_name", "must not be empty"));
        }
        let robot = self.store.find_or_create_robot(robot_name)?;

        let mut wm = WorkingMemory::new(max_tokens);
        for (node, assoc) in self.store.working_set(robot.id)? {
            if !wm.has_space(node.token_count) {
                continue;
            }
            wm.add(node.id, node.content, node.token_count, assoc.access_count, 1.0, false);
        }

        Ok(Agent {
            engine: self.clone(),
            robot,
            wm: Arc::new(Mutex::new(wm)),
            channel: None,
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn tags(&self) -> &TagEngine {
        &self.tag_engine
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn search(&self) -> &HybridSearch {
        &self.search
    }

    pub fn enrichment(&self) -> &EnrichmentPipeline {
        &self.enrichment
    }

    pub fn timeframes(&self) -> &TimeframeParser {
        &self.timeframes
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineResult<StoreStats> {
        self.store.stats()
    }

    /// Composed health report (pool, latencies, breakers, cache, issues).
    pub fn health(&self) -> HealthReport {
        self.telemetry.report(&self.store, &self.breakers, &self.cache)
    }

    /// Hard-delete tombstones older than `older_than`. Destructive, so it
    /// demands the same confirmation token as a hard forget.
    pub fn purge_deleted(
        &self,
        older_than: chrono::Duration,
        confirm: Option<&str>,
    ) -> EngineResult<usize> {
        require_confirmation(confirm)?;
        let purged = self.store.purge_deleted(older_than)?;
        if purged > 0 {
            self.cache.invalidate_all();
            info!("[engine] purged {purged} tombstoned nodes");
        }
        Ok(purged)
    }

    /// The tombstone-inclusive view.
    pub fn tombstoned(&self) -> EngineResult<Vec<Node>> {
        self.store.tombstoned_nodes()
    }
}

fn require_confirmation(confirm: Option<&str>) -> EngineResult<()> {
    if confirm != Some("confirmed") {
        return Err(EngineError::validation(
            "confirm",
            "destructive operation requires confirm=\"confirmed\"",
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Recall options
// ═══════════════════════════════════════════════════════════════════════════

/// Tuning for a recall. `timeframe: None` auto-extracts from the query.
#[derive(Clone, Default)]
pub struct RecallOptions {
    pub timeframe: Option<TimeframeValue>,
    pub limit: Option<usize>,
    pub strategy: RecallStrategy,
    /// Restrict to these node ids (group scoping).
    pub scope: Option<HashSet<i64>>,
}

const DEFAULT_RECALL_LIMIT: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════
// Agent
// ═══════════════════════════════════════════════════════════════════════════

/// One robot's handle onto the substrate. Cheap to clone; clones share the
/// same working memory.
#[derive(Clone)]
pub struct Agent {
    engine: Arc<Engine>,
    robot: Robot,
    wm: Arc<Mutex<WorkingMemory>>,
    /// Change-channel name this agent publishes on (set for group members).
    channel: Option<String>,
}

impl Agent {
    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    pub fn name(&self) -> &str {
        &self.robot.name
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Wire this agent onto a group's change channel.
    pub(crate) fn set_channel(&mut self, channel: Option<String>) {
        self.channel = channel;
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Persist content and schedule enrichment. Returns the node id; a
    /// second write of identical content returns the same id without
    /// re-enriching.
    pub async fn remember(
        &self,
        content: &str,
        tags: &[String],
        metadata: &HashMap<String, serde_json::Value>,
    ) -> EngineResult<i64> {
        validate_content(content)?;
        validate_metadata(metadata)?;
        validate_tag_list(tags)?;

        // Step 1 — the only step whose failure reaches the caller.
        let outcome = self.engine.enrichment.save(content, metadata, false)?;
        self.engine.store.associate_node(self.robot.id, outcome.node_id)?;

        // Manual tags apply synchronously, ancestors included, before any
        // provider sees the node.
        if !tags.is_empty() {
            let (_, skipped) = self.engine.tag_engine.add_tags_to_node(outcome.node_id, tags)?;
            for name in &skipped {
                warn!("[agent:{}] skipped invalid manual tag {name:?}", self.robot.name);
            }
        }

        self.engine.cache.invalidate_all();

        if outcome.is_new {
            let agent = self.clone();
            let node_id = outcome.node_id;
            self.engine
                .jobs
                .spawn(
                    "enrichment",
                    Box::pin(async move {
                        agent.engine.enrichment.enrich(node_id, Some(agent.robot.id)).await;
                        agent.finalize(node_id)?;
                        Ok(())
                    }),
                )
                .await;
        } else {
            // Dedup hit: no enrichment, but the robot is actively using this
            // memory — it still enters the working set.
            self.finalize(outcome.node_id)?;
        }

        Ok(outcome.node_id)
    }

    /// Workflow step 5: working-memory placement, eviction flag clearing,
    /// robot activity, `added` event.
    pub(crate) fn finalize(&self, node_id: i64) -> EngineResult<()> {
        let Some(node) = self.engine.store.get_node(node_id)? else {
            // Forgotten before enrichment finished; nothing to place.
            return Ok(());
        };

        let evicted = {
            let mut wm = self.wm.lock();
            if node.token_count > wm.max_tokens() {
                warn!(
                    "[agent:{}] node {} ({} tokens) exceeds the working budget ({}), not placed",
                    self.robot.name,
                    node_id,
                    node.token_count,
                    wm.max_tokens()
                );
                Vec::new()
            } else {
                let evicted = if wm.has_space(node.token_count) {
                    Vec::new()
                } else {
                    wm.evict_to_make_space(node.token_count)
                };
                wm.add(node.id, node.content.clone(), node.token_count, 0, 1.0, false);
                evicted
            }
        };

        for entry in &evicted {
            self.engine.store.set_working_memory(self.robot.id, entry.node_id, false)?;
            self.publish(ChangeKind::Evicted, Some(entry.node_id));
        }
        if self.wm.lock().contains(node_id) {
            self.engine.store.set_working_memory(self.robot.id, node_id, true)?;
            self.engine.store.record_access(self.robot.id, node_id)?;
        }
        self.engine.store.touch_robot(self.robot.id)?;
        self.publish(ChangeKind::Added, Some(node_id));
        // Enrichment wrote embeddings/tags after the write-time
        // invalidation; clear again so reads see the enriched node.
        self.engine.cache.invalidate_all();
        Ok(())
    }

    /// Replace a node's content. Drops the stale embedding and re-runs
    /// enrichment; the working-memory mirror picks up the new text.
    pub async fn update_content(&self, node_id: i64, content: &str) -> EngineResult<()> {
        validate_content(content)?;
        let tokens = self.engine.enrichment.tokenizer().count(content);
        self.engine.store.update_node_content(node_id, content, tokens)?;
        self.engine.cache.invalidate_all();

        {
            let mut wm = self.wm.lock();
            if wm.remove(node_id).is_some() && wm.has_space(tokens) {
                wm.add(node_id, content.to_string(), tokens, 0, 1.0, false);
            }
        }

        let agent = self.clone();
        self.engine
            .jobs
            .spawn(
                "re-enrichment",
                Box::pin(async move {
                    agent.engine.enrichment.enrich(node_id, Some(agent.robot.id)).await;
                    agent.engine.cache.invalidate_all();
                    Ok(())
                }),
            )
            .await;
        Ok(())
    }

    /// Soft-delete by default. A hard delete requires `confirm = "confirmed"`.
    pub fn forget(&self, node_id: i64, soft: bool, confirm: Option<&str>) -> EngineResult<()> {
        if soft {
            self.engine.store.soft_delete_node(node_id)?;
        } else {
            require_confirmation(confirm)?;
            self.engine.store.hard_delete_node(node_id)?;
        }

        if self.wm.lock().remove(node_id).is_some() {
            // Row may already be gone on the hard path; best effort.
            self.engine.store.set_working_memory(self.robot.id, node_id, false).ok();
            self.publish(ChangeKind::Evicted, Some(node_id));
        }
        self.engine.cache.invalidate_all();
        Ok(())
    }

    /// Clear a tombstone. The node keeps its id; it does not re-enter
    /// working memory until used again.
    pub fn restore(&self, node_id: i64) -> EngineResult<()> {
        self.engine.store.restore_node(node_id)?;
        self.engine.cache.invalidate_all();
        Ok(())
    }

    /// Fetch one node and count the access.
    pub fn retrieve(&self, node_id: i64) -> EngineResult<Node> {
        let node = self
            .engine
            .store
            .get_node(node_id)?
            .ok_or_else(|| EngineError::not_found("node", node_id))?;
        self.engine.store.record_access(self.robot.id, node_id)?;
        self.wm.lock().touch(node_id);
        Ok(node)
    }

    // ── Tag surface ─────────────────────────────────────────────────────

    /// Tag a node manually (ancestors materialize). Invalid names fail.
    pub fn add_tag(&self, node_id: i64, name: &str) -> EngineResult<Vec<String>> {
        if self.engine.store.get_node(node_id)?.is_none() {
            return Err(EngineError::not_found("node", node_id));
        }
        let chain = self.engine.tag_engine.find_or_create_with_ancestors(name)?;
        for tag in &chain {
            self.engine.store.associate_tag(node_id, tag.id)?;
        }
        self.engine.cache.invalidate_all();
        Ok(chain.into_iter().map(|t| t.name).collect())
    }

    /// Remove one tag from a node (ancestors stay).
    pub fn remove_tag(&self, node_id: i64, name: &str) -> EngineResult<()> {
        self.engine.tag_engine.remove_tag_from_node(node_id, name)?;
        self.engine.cache.invalidate_all();
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Hybrid recall. With no explicit timeframe the query is run through
    /// the timeframe parser and searched with the phrase stripped.
    pub async fn recall(&self, query: &str, opts: RecallOptions) -> EngineResult<Vec<RecallHit>> {
        let limit = opts.limit.unwrap_or(DEFAULT_RECALL_LIMIT);
        if limit == 0 || limit > MAX_ARRAY_ITEMS {
            return Err(EngineError::validation(
                "limit",
                format!("must be in 1..={MAX_ARRAY_ITEMS}, got {limit}"),
            ));
        }

        let (search_query, timeframe) = self.resolve_timeframe(query, &opts)?;

        let hits = self
            .engine
            .search
            .search(&search_query, timeframe, limit, opts.strategy, opts.scope.as_ref())
            .await?;

        for hit in &hits {
            self.engine.store.record_access(self.robot.id, hit.node_id).ok();
            self.wm.lock().touch(hit.node_id);
        }
        self.engine.store.touch_robot(self.robot.id)?;
        Ok(hits)
    }

    /// The `[]string` form of recall: contents only.
    pub async fn recall_content(
        &self,
        query: &str,
        opts: RecallOptions,
    ) -> EngineResult<Vec<String>> {
        Ok(self.recall(query, opts).await?.into_iter().map(|h| h.content).collect())
    }

    fn resolve_timeframe(
        &self,
        query: &str,
        opts: &RecallOptions,
    ) -> EngineResult<(String, Option<TimeFrame>)> {
        match &opts.timeframe {
            Some(value) => {
                let tf = self.engine.timeframes.normalize(value, Some(query))?;
                Ok((query.to_string(), tf))
            }
            None => {
                let extraction = self.engine.timeframes.extract(query);
                Ok((extraction.query, extraction.timeframe))
            }
        }
    }

    // ── Working memory surface ──────────────────────────────────────────

    /// Assemble a context string from the working set. Unknown strategies
    /// fail with a `Validation` error naming the field.
    pub fn create_context(&self, strategy: &str, max_tokens: Option<usize>) -> EngineResult<String> {
        let strategy = WorkingMemory::parse_strategy(strategy)?;
        let wm = self.wm.lock();
        let budget = max_tokens.unwrap_or_else(|| wm.max_tokens());
        wm.assemble_context(strategy, budget)
    }

    /// The canonical working set, straight from the store.
    pub fn working_set(&self) -> EngineResult<Vec<(Node, NodeAssociation)>> {
        self.engine.store.working_set(self.robot.id)
    }

    /// In-process working-memory token usage.
    pub fn working_tokens(&self) -> usize {
        self.wm.lock().token_usage()
    }

    pub fn max_tokens(&self) -> usize {
        self.wm.lock().max_tokens()
    }

    // ── Events ──────────────────────────────────────────────────────────

    fn publish(&self, kind: ChangeKind, node_id: Option<i64>) {
        if let Some(channel) = &self.channel {
            let event = ChangeEvent { event: kind, node_id, robot_id: self.robot.id };
            if let Err(e) = self.engine.bus.publish(channel, &event) {
                warn!("[agent:{}] event publish failed: {e}", self.robot.name);
            }
        }
    }

    /// Apply an incoming `added` sync: flag + mirror, no republish.
    pub(crate) fn apply_added(&self, node_id: i64) -> EngineResult<()> {
        let Some(node) = self.engine.store.get_node(node_id)? else {
            return Ok(());
        };
        self.engine.store.associate_node(self.robot.id, node_id)?;
        self.engine.store.set_working_memory(self.robot.id, node_id, true)?;

        let mut wm = self.wm.lock();
        if wm.contains(node_id) || node.token_count > wm.max_tokens() {
            return Ok(());
        }
        let evicted = if wm.has_space(node.token_count) {
            Vec::new()
        } else {
            wm.evict_to_make_space(node.token_count)
        };
        wm.add(node.id, node.content, node.token_count, 0, 1.0, false);
        drop(wm);

        for entry in evicted {
            self.engine.store.set_working_memory(self.robot.id, entry.node_id, false)?;
        }
        Ok(())
    }

    /// Apply an incoming `evicted` sync: drop flag + mirror, no republish.
    pub(crate) fn apply_evicted(&self, node_id: i64) -> EngineResult<()> {
        self.wm.lock().remove(node_id);
        self.engine.store.set_working_memory(self.robot.id, node_id, false)
    }

    /// Apply an incoming `cleared` sync.
    pub(crate) fn apply_cleared(&self) -> EngineResult<()> {
        self.wm.lock().clear();
        self.engine.store.clear_working_memory(self.robot.id)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Input validation
// ═══════════════════════════════════════════════════════════════════════════

fn validate_content(content: &str) -> EngineResult<()> {
    if content.is_empty() {
        return Err(EngineError::validation("content", "must not be empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(EngineError::validation(
            "content",
            format!("exceeds {MAX_CONTENT_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn validate_metadata(metadata: &HashMap<String, serde_json::Value>) -> EngineResult<()> {
    for (key, value) in metadata {
        if key.is_empty() || key.chars().count() > MAX_METADATA_KEY_CHARS {
            return Err(EngineError::validation(
                "metadata",
                format!("key {key:?} must be 1..={MAX_METADATA_KEY_CHARS} chars"),
            ));
        }
        let rendered = value.to_string();
        if rendered.chars().count() > MAX_METADATA_VALUE_CHARS {
            return Err(EngineError::validation(
                "metadata",
                format!("value for {key:?} exceeds {MAX_METADATA_VALUE_CHARS} chars"),
            ));
        }
        if key == "importance" {
            let ok = value
                .as_f64()
                .is_some_and(|v| (MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&v));
            if !ok {
                return Err(EngineError::validation(
                    "importance",
                    format!("must be a number in {MIN_IMPORTANCE}..={MAX_IMPORTANCE}"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_tag_list(tags: &[String]) -> EngineResult<()> {
    if tags.len() > MAX_ARRAY_ITEMS {
        return Err(EngineError::validation(
            "tags",
            format!("at most {MAX_ARRAY_ITEMS} items"),
        ));
    }
    Ok(())
}
