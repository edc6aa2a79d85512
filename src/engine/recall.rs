// ── Mnemo Engine: Hybrid Recall ─────────────────────────────────────────────
//
// The retrieval core. Three retrievers run concurrently:
//
//   vector    — embed the query (breaker-guarded), cosine scan
//   fulltext  — FTS5 BM25
//   tags      — extract tags from the query (breaker-guarded), match nodes
//               through the ontology with hierarchical depth scoring
//
// Per-retriever scores are min-max normalized, then the lists are fused by
// Reciprocal Rank Fusion: each candidate at 1-based rank r in a retriever
// contributes 1/(k + r), k = 60. Every hit carries its full scoring
// provenance (sources, per-retriever ranks and scores, matched tags).
//
// Results are cached in the TTL+LRU query cache; a provider failure degrades
// that retriever to an empty list instead of failing the recall.

use crate::atoms::constants::{
    EMBEDDING_CACHE_MAX_ENTRIES, RETRIEVER_CANDIDATE_LIMIT, RRF_K, TAG_DEPTH_SCORE_CAP,
    TAG_MULTI_CHAIN_BONUS, TAG_MULTI_CHAIN_MIN,
};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{RecallHit, RecallSource, RecallStrategy, TimeFrame};
use crate::engine::breaker::BreakerRegistry;
use crate::engine::providers::{EmbeddingProvider, TagProvider};
use crate::engine::query_cache::QueryCache;
use crate::engine::store::{content_hash, MemoryStore, TagCandidate};
use crate::engine::tags::{self, TagEngine};
use crate::engine::telemetry::Telemetry;
use log::warn;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Embedding cache
// ═══════════════════════════════════════════════════════════════════════════

/// Small content-hash → vector LRU so repeated query embeds skip the
/// provider. Unlike the query cache this is never invalidated by writes —
/// an embedding is a pure function of the text.
#[derive(Default)]
pub struct EmbeddingCache {
    inner: Mutex<(HashMap<String, Vec<f32>>, VecDeque<String>)>,
}

impl EmbeddingCache {
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = content_hash(text);
        self.inner.lock().0.get(&key).cloned()
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = content_hash(text);
        let mut inner = self.inner.lock();
        if !inner.0.contains_key(&key) {
            inner.1.push_back(key.clone());
            if inner.1.len() > EMBEDDING_CACHE_MAX_ENTRIES {
                if let Some(oldest) = inner.1.pop_front() {
                    inner.0.remove(&oldest);
                }
            }
        }
        inner.0.insert(key, vector);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pure scoring helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Min-max normalize scores in place: min → 0, max → 1. A set of identical
/// scores maps all to 1.0; a single element stays unchanged.
pub fn min_max_normalize(scores: &mut [(i64, f64)]) {
    if scores.len() < 2 {
        return;
    }
    let min = scores.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = scores.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < 1e-12 {
        for (_, s) in scores.iter_mut() {
            *s = 1.0;
        }
        return;
    }
    for (_, s) in scores.iter_mut() {
        *s = (*s - min) / (max - min);
    }
}

/// Hierarchical tag-depth score for one node.
///
/// For each extracted chain, the match ratio is the deepest matched ancestor
/// over the chain's full depth; the node score is the mean over matched
/// chains (no matched chains → 0.0), plus a +0.05 bonus for matching two or
/// more chains, capped at 1.1.
pub fn tag_depth_score(node_tags: &[String], chains: &[String]) -> f64 {
    if chains.is_empty() || node_tags.is_empty() {
        return 0.0;
    }
    let tag_set: HashSet<&str> = node_tags.iter().map(String::as_str).collect();

    let mut matched_ratios: Vec<f64> = Vec::new();
    for chain in chains {
        let ancestors = tags::ancestors(chain);
        let max_depth = ancestors.len() as f64;
        let mut best = 0.0f64;
        for (i, ancestor) in ancestors.iter().enumerate() {
            if tag_set.contains(ancestor.as_str()) {
                best = best.max((i + 1) as f64 / max_depth);
            }
        }
        if best > 0.0 {
            matched_ratios.push(best);
        }
    }

    if matched_ratios.is_empty() {
        return 0.0;
    }
    let mut score = matched_ratios.iter().sum::<f64>() / matched_ratios.len() as f64;
    if matched_ratios.len() >= TAG_MULTI_CHAIN_MIN {
        score += TAG_MULTI_CHAIN_BONUS;
    }
    score.min(TAG_DEPTH_SCORE_CAP)
}

/// One retriever's ordered output, ready for fusion.
#[derive(Debug, Default, Clone)]
pub struct RetrieverOutput {
    /// (node_id, normalized score), best first.
    pub ranked: Vec<(i64, f64)>,
    /// Tag names that matched, per node (tags retriever only).
    pub matched_tags: HashMap<i64, Vec<String>>,
}

/// Fuse up to three retriever outputs by RRF. Returns hits without content
/// (the caller hydrates), ordered by descending rrf_score with node id as
/// the deterministic tiebreak.
pub fn rrf_fuse(
    vector: &RetrieverOutput,
    fulltext: &RetrieverOutput,
    tag: &RetrieverOutput,
) -> Vec<RecallHit> {
    let mut hits: HashMap<i64, RecallHit> = HashMap::new();

    let mut absorb = |output: &RetrieverOutput, source: RecallSource| {
        for (rank0, (node_id, score)) in output.ranked.iter().enumerate() {
            let rank = rank0 + 1;
            let hit = hits.entry(*node_id).or_insert_with(|| RecallHit {
                node_id: *node_id,
                content: String::new(),
                rrf_score: 0.0,
                sources: Vec::new(),
                vector_rank: None,
                fulltext_rank: None,
                tag_rank: None,
                similarity: None,
                text_rank: None,
                tag_depth_score: None,
                matched_tags: Vec::new(),
            });
            hit.rrf_score += 1.0 / (RRF_K + rank as f64);
            hit.sources.push(source);
            match source {
                RecallSource::Vector => {
                    hit.vector_rank = Some(rank);
                    hit.similarity = Some(*score);
                }
                RecallSource::Fulltext => {
                    hit.fulltext_rank = Some(rank);
                    hit.text_rank = Some(*score);
                }
                RecallSource::Tags => {
                    hit.tag_rank = Some(rank);
                    hit.tag_depth_score = Some(*score);
                    if let Some(matched) = output.matched_tags.get(node_id) {
                        hit.matched_tags = matched.clone();
                    }
                }
            }
        }
    };

    absorb(vector, RecallSource::Vector);
    absorb(fulltext, RecallSource::Fulltext);
    absorb(tag, RecallSource::Tags);

    let mut fused: Vec<RecallHit> = hits.into_values().collect();
    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.node_id.cmp(&b.node_id))
    });
    fused
}

// ═══════════════════════════════════════════════════════════════════════════
// The search pipeline
// ═══════════════════════════════════════════════════════════════════════════

/// Hybrid search over the shared store.
#[derive(Clone)]
pub struct HybridSearch {
    store: Arc<MemoryStore>,
    tag_engine: TagEngine,
    embedding: Option<Arc<dyn EmbeddingProvider>>,
    tag_provider: Option<Arc<dyn TagProvider>>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<QueryCache>,
    embed_cache: Arc<EmbeddingCache>,
    telemetry: Arc<Telemetry>,
    breaker_threshold: u32,
    breaker_cooldown_secs: u64,
}

impl HybridSearch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MemoryStore>,
        tag_engine: TagEngine,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
        tag_provider: Option<Arc<dyn TagProvider>>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<QueryCache>,
        embed_cache: Arc<EmbeddingCache>,
        telemetry: Arc<Telemetry>,
        breaker_threshold: u32,
        breaker_cooldown_secs: u64,
    ) -> Self {
        Self {
            store,
            tag_engine,
            embedding,
            tag_provider,
            breakers,
            cache,
            embed_cache,
            telemetry,
            breaker_threshold,
            breaker_cooldown_secs,
        }
    }

    /// Embed text through the breaker-guarded provider, with the pure
    /// embedding cache in front.
    pub async fn embed_query(&self, text: &str) -> EngineResult<Option<Vec<f32>>> {
        let Some(provider) = &self.embedding else {
            return Ok(None);
        };
        if let Some(cached) = self.embed_cache.get(text) {
            return Ok(Some(cached));
        }
        let breaker =
            self.breakers.get("embedding", self.breaker_threshold, self.breaker_cooldown_secs);
        let _timer = self.telemetry.time("provider.embedding");
        let vector = breaker.guard(provider.embed(text)).await?;
        self.embed_cache.put(text, vector.clone());
        Ok(Some(vector))
    }

    /// Run the full recall: retrievers → normalize → fuse → hydrate → cache.
    pub async fn search(
        &self,
        query: &str,
        timeframe: Option<TimeFrame>,
        limit: usize,
        strategy: RecallStrategy,
        scope: Option<&HashSet<i64>>,
    ) -> EngineResult<Vec<RecallHit>> {
        let cache_key = Self::cache_key(query, timeframe, limit, strategy, scope);
        if let Some(cached) = self.cache.get::<Vec<RecallHit>>(&cache_key) {
            return Ok(cached);
        }

        let _timer = self.telemetry.time("recall");
        let want_vector = matches!(strategy, RecallStrategy::Hybrid | RecallStrategy::Vector);
        let want_fulltext = matches!(strategy, RecallStrategy::Hybrid | RecallStrategy::Fulltext);
        let want_tags = matches!(strategy, RecallStrategy::Hybrid);

        let (vector, fulltext, tag) = tokio::join!(
            self.vector_leg(query, timeframe, scope, want_vector),
            self.fulltext_leg(query, timeframe, scope, want_fulltext),
            self.tag_leg(query, timeframe, scope, want_tags),
        );

        let mut fused = rrf_fuse(&vector, &fulltext, &tag);
        fused.truncate(limit);

        // Hydrate content; drop anything deleted since the retriever pass.
        let ids: Vec<i64> = fused.iter().map(|h| h.node_id).collect();
        let nodes = self.store.get_nodes(&ids)?;
        fused.retain_mut(|hit| match nodes.get(&hit.node_id) {
            Some(node) => {
                hit.content = node.content.clone();
                true
            }
            None => false,
        });

        self.cache.put(cache_key, &fused);
        Ok(fused)
    }

    fn cache_key(
        query: &str,
        timeframe: Option<TimeFrame>,
        limit: usize,
        strategy: RecallStrategy,
        scope: Option<&HashSet<i64>>,
    ) -> String {
        // Scope sets iterate in arbitrary order; canonicalize.
        let scope_sorted: Option<BTreeSet<i64>> = scope.map(|s| s.iter().copied().collect());
        QueryCache::key(
            "recall",
            &(
                query,
                timeframe.map(|tf| (tf.start.timestamp_millis(), tf.end.timestamp_millis())),
                limit,
                format!("{strategy:?}"),
                scope_sorted,
            ),
        )
    }

    async fn vector_leg(
        &self,
        query: &str,
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        enabled: bool,
    ) -> RetrieverOutput {
        if !enabled {
            return RetrieverOutput::default();
        }
        let embedding = match self.embed_query(query).await {
            Ok(Some(vector)) => vector,
            Ok(None) => return RetrieverOutput::default(),
            Err(e) => {
                warn!("[recall] vector retriever skipped: {e}");
                return RetrieverOutput::default();
            }
        };
        let _timer = self.telemetry.time("recall.vector");
        let candidates = match self.store.vector_candidates(
            &embedding,
            timeframe,
            scope,
            RETRIEVER_CANDIDATE_LIMIT,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!("[recall] vector retriever failed: {e}");
                return RetrieverOutput::default();
            }
        };
        let mut ranked: Vec<(i64, f64)> =
            candidates.into_iter().map(|c| (c.node_id, c.similarity)).collect();
        min_max_normalize(&mut ranked);
        RetrieverOutput { ranked, matched_tags: HashMap::new() }
    }

    async fn fulltext_leg(
        &self,
        query: &str,
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        enabled: bool,
    ) -> RetrieverOutput {
        if !enabled {
            return RetrieverOutput::default();
        }
        let _timer = self.telemetry.time("recall.fulltext");
        let candidates = match self.store.fulltext_candidates(
            query,
            timeframe,
            scope,
            RETRIEVER_CANDIDATE_LIMIT,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!("[recall] fulltext retriever failed: {e}");
                return RetrieverOutput::default();
            }
        };
        let mut ranked: Vec<(i64, f64)> =
            candidates.into_iter().map(|c| (c.node_id, c.text_rank)).collect();
        min_max_normalize(&mut ranked);
        RetrieverOutput { ranked, matched_tags: HashMap::new() }
    }

    async fn tag_leg(
        &self,
        query: &str,
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        enabled: bool,
    ) -> RetrieverOutput {
        if !enabled {
            return RetrieverOutput::default();
        }
        let Some(provider) = &self.tag_provider else {
            return RetrieverOutput::default();
        };

        let sample = self.store.sample_tag_names(crate::atoms::constants::TAG_ONTOLOGY_SAMPLE);
        let sample = sample.unwrap_or_default();
        let breaker = self.breakers.get("tags", self.breaker_threshold, self.breaker_cooldown_secs);
        let extracted = {
            let _timer = self.telemetry.time("provider.tags");
            match breaker.guard(provider.extract_tags(query, &sample)).await {
                Ok(names) => names,
                Err(e) => {
                    warn!("[recall] tag retriever skipped: {e}");
                    return RetrieverOutput::default();
                }
            }
        };

        // Only validated names participate; empty extraction → empty result.
        let chains: Vec<String> = extracted
            .into_iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| tags::is_valid(n))
            .collect();
        if chains.is_empty() {
            return RetrieverOutput::default();
        }

        let _timer = self.telemetry.time("recall.tags");
        let probe = TagEngine::expand_ancestors(&chains);
        let candidates: Vec<TagCandidate> = match self.store.tag_candidates(
            &probe,
            timeframe,
            scope,
            RETRIEVER_CANDIDATE_LIMIT,
        ) {
            Ok(c) => c,
            Err(e) => {
                warn!("[recall] tag retriever failed: {e}");
                return RetrieverOutput::default();
            }
        };

        let mut matched_tags: HashMap<i64, Vec<String>> = HashMap::new();
        let mut ranked: Vec<(i64, f64)> = candidates
            .into_iter()
            .map(|c| {
                let score = tag_depth_score(&c.matched, &chains);
                matched_tags.insert(c.node_id, c.matched);
                (c.node_id, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
        });
        min_max_normalize(&mut ranked);
        RetrieverOutput { ranked, matched_tags }
    }

    /// The tag engine backing this search (shared with enrichment).
    pub fn tag_engine(&self) -> &TagEngine {
        &self.tag_engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_spreads_to_unit_range() {
        let mut scores = vec![(1, 2.0), (2, 4.0), (3, 6.0)];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![(1, 0.0), (2, 0.5), (3, 1.0)]);
    }

    #[test]
    fn test_normalize_identical_all_one() {
        let mut scores = vec![(1, 3.3), (2, 3.3)];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![(1, 1.0), (2, 1.0)]);
    }

    #[test]
    fn test_normalize_singleton_unchanged() {
        let mut scores = vec![(1, 0.42)];
        min_max_normalize(&mut scores);
        assert_eq!(scores, vec![(1, 0.42)]);
    }

    #[test]
    fn test_tag_depth_full_chain_match() {
        let node = vec!["devops".into(), "devops:kubernetes".into(), "devops:kubernetes:pods".into()];
        let chains = vec!["devops:kubernetes:pods".to_string()];
        assert!((tag_depth_score(&node, &chains) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tag_depth_partial_match() {
        // Node only has the first two levels of a three-level chain: 2/3.
        let node = vec!["devops".into(), "devops:kubernetes".into()];
        let chains = vec!["devops:kubernetes:pods".to_string()];
        assert!((tag_depth_score(&node, &chains) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_tag_depth_multi_chain_bonus_and_cap() {
        let node = vec![
            "devops".into(),
            "devops:kubernetes".into(),
            "devops:kubernetes:pods".into(),
            "rust".into(),
        ];
        // Two full matches: mean 1.0 + 0.05 bonus = 1.05.
        let chains = vec!["devops:kubernetes:pods".to_string(), "rust".to_string()];
        assert!((tag_depth_score(&node, &chains) - 1.05).abs() < 1e-9);

        // The score never exceeds the cap.
        assert!(tag_depth_score(&node, &chains) <= TAG_DEPTH_SCORE_CAP);
    }

    #[test]
    fn test_tag_depth_no_match() {
        let node = vec!["cooking".to_string()];
        let chains = vec!["devops:kubernetes".to_string()];
        assert_eq!(tag_depth_score(&node, &chains), 0.0);
    }

    fn output(ranked: Vec<(i64, f64)>) -> RetrieverOutput {
        RetrieverOutput { ranked, matched_tags: HashMap::new() }
    }

    #[test]
    fn test_rrf_all_three_sources() {
        // Node 2 appears in all three retrievers and must win the fusion.
        let vector = output(vec![(1, 0.9), (2, 0.8)]);
        let fulltext = output(vec![(2, 1.5), (3, 1.2)]);
        let tag = output(vec![(2, 1.0), (4, 0.5)]);

        let fused = rrf_fuse(&vector, &fulltext, &tag);
        assert_eq!(fused.len(), 4);

        let top = &fused[0];
        assert_eq!(top.node_id, 2);
        assert_eq!(
            top.sources,
            vec![RecallSource::Vector, RecallSource::Fulltext, RecallSource::Tags]
        );
        // rank 2 in vector, rank 1 in fulltext and tags.
        let expected = 1.0 / 62.0 + 1.0 / 61.0 + 1.0 / 61.0;
        assert!((top.rrf_score - expected).abs() < 1e-12);
        assert_eq!(top.vector_rank, Some(2));
        assert_eq!(top.fulltext_rank, Some(1));
        assert_eq!(top.tag_rank, Some(1));

        // Every single-source node scores below the triple-source node.
        for hit in &fused[1..] {
            assert!(hit.rrf_score < top.rrf_score);
            assert_eq!(hit.sources.len(), 1);
        }
    }

    #[test]
    fn test_rrf_scores_match_formula() {
        let vector = output(vec![(1, 1.0)]);
        let fused = rrf_fuse(&vector, &RetrieverOutput::default(), &RetrieverOutput::default());
        assert_eq!(fused.len(), 1);
        assert!((fused[0].rrf_score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[0].similarity, Some(1.0));
        assert_eq!(fused[0].text_rank, None);
        assert_eq!(fused[0].tag_depth_score, None);
    }

    #[test]
    fn test_rrf_deterministic_tiebreak() {
        // Same rank in distinct retrievers → identical rrf; lower id first.
        let vector = output(vec![(7, 1.0)]);
        let fulltext = output(vec![(3, 1.0)]);
        let fused = rrf_fuse(&vector, &fulltext, &RetrieverOutput::default());
        assert_eq!(fused[0].node_id, 3);
        assert_eq!(fused[1].node_id, 7);
    }

    #[test]
    fn test_embedding_cache_lru() {
        let cache = EmbeddingCache::default();
        cache.put("a", vec![1.0]);
        assert_eq!(cache.get("a"), Some(vec![1.0]));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 1);
    }
}
