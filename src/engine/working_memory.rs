// ── Mnemo Engine: Working Memory ────────────────────────────────────────────
//
// The per-robot active set: a bounded, token-accounted, in-process mirror of
// the robot's `working_memory = true` associations.
//
//   - Token-budget-aware: entries are accounted against `max_tokens`
//   - LFU+LRU hybrid eviction: score = access_count / (1 + age_seconds),
//     lowest evicted first, ties broken by older last_accessed
//   - Caller-owned side effects: `add` never evicts on its own — callers
//     check `has_space` and call `evict_to_make_space`, which returns the
//     evicted entries so their long-term flags can be cleared
//
// The struct does NOT do database I/O and is not internally synchronized.
// The agent facade wraps it in Arc<Mutex<_>> so its owner and change-channel
// callbacks see a consistent snapshot.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{ContextStrategy, WorkingEntry};
use chrono::{DateTime, Utc};

pub struct WorkingMemory {
    entries: Vec<WorkingEntry>,
    max_tokens: usize,
    current_tokens: usize,
}

impl WorkingMemory {
    /// Create an empty working memory with the given token budget.
    pub fn new(max_tokens: usize) -> Self {
        Self { entries: Vec::new(), max_tokens, current_tokens: 0 }
    }

    /// Insert or overwrite the entry for a node. Does not evict; callers
    /// must ensure space first.
    pub fn add(
        &mut self,
        node_id: i64,
        content: String,
        tokens: usize,
        access_count: u32,
        importance: f64,
        from_recall: bool,
    ) {
        let now = Utc::now();
        if let Some(pos) = self.entries.iter().position(|e| e.node_id == node_id) {
            let old = self.entries.remove(pos);
            self.current_tokens = self.current_tokens.saturating_sub(old.tokens);
        }
        self.current_tokens += tokens;
        self.entries.push(WorkingEntry {
            node_id,
            content,
            tokens,
            access_count,
            importance,
            inserted_at: now,
            last_accessed: now,
            from_recall,
        });
    }

    /// True when `tokens` more would still fit in the budget.
    pub fn has_space(&self, tokens: usize) -> bool {
        self.current_tokens + tokens <= self.max_tokens
    }

    /// Evict lowest-scoring entries until at least `needed` tokens are free.
    /// Returns the evicted entries so the caller can clear their
    /// `working_memory` flags (and publish eviction events).
    pub fn evict_to_make_space(&mut self, needed: usize) -> Vec<WorkingEntry> {
        let mut evicted = Vec::new();
        if needed > self.max_tokens {
            return evicted;
        }
        let now = Utc::now();
        while self.current_tokens + needed > self.max_tokens && !self.entries.is_empty() {
            let victim = self.lowest_scoring(now);
            let entry = self.entries.remove(victim);
            self.current_tokens = self.current_tokens.saturating_sub(entry.tokens);
            log::debug!(
                "[working-memory] evicted node {} ({} tokens, {} accesses)",
                entry.node_id,
                entry.tokens,
                entry.access_count
            );
            evicted.push(entry);
        }
        evicted
    }

    /// Index of the entry with the lowest eviction score; ties go to the
    /// older `last_accessed`.
    fn lowest_scoring(&self, now: DateTime<Utc>) -> usize {
        let mut best = 0usize;
        let mut best_score = f64::INFINITY;
        let mut best_accessed = Utc::now();
        for (i, entry) in self.entries.iter().enumerate() {
            let score = eviction_score(entry, now);
            let better = score < best_score
                || (score == best_score && entry.last_accessed < best_accessed);
            if better {
                best = i;
                best_score = score;
                best_accessed = entry.last_accessed;
            }
        }
        best
    }

    /// Remove a specific entry (e.g. on forget or a cross-robot eviction
    /// event). Returns it if present.
    pub fn remove(&mut self, node_id: i64) -> Option<WorkingEntry> {
        let pos = self.entries.iter().position(|e| e.node_id == node_id)?;
        let entry = self.entries.remove(pos);
        self.current_tokens = self.current_tokens.saturating_sub(entry.tokens);
        Some(entry)
    }

    /// Record an access: bumps the frequency counter and recency stamp.
    pub fn touch(&mut self, node_id: i64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.node_id == node_id) {
            entry.access_count += 1;
            entry.last_accessed = Utc::now();
        }
    }

    pub fn contains(&self, node_id: i64) -> bool {
        self.entries.iter().any(|e| e.node_id == node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn token_usage(&self) -> usize {
        self.current_tokens
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn entries(&self) -> &[WorkingEntry] {
        &self.entries
    }

    /// Drop everything.
    pub fn clear(&mut self) -> Vec<WorkingEntry> {
        self.current_tokens = 0;
        std::mem::take(&mut self.entries)
    }

    /// Concatenate entries in strategy order within `max_tokens`.
    ///
    /// Strategies:
    ///   recent   — newest `last_accessed` first
    ///   frequent — highest `access_count` first
    ///   balanced — `importance * (1 / age_days)`, higher first
    pub fn assemble_context(
        &self,
        strategy: ContextStrategy,
        max_tokens: usize,
    ) -> EngineResult<String> {
        let now = Utc::now();
        let mut ordered: Vec<&WorkingEntry> = self.entries.iter().collect();
        match strategy {
            ContextStrategy::Recent => {
                ordered.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
            }
            ContextStrategy::Frequent => {
                ordered.sort_by(|a, b| {
                    b.access_count
                        .cmp(&a.access_count)
                        .then(b.last_accessed.cmp(&a.last_accessed))
                });
            }
            ContextStrategy::Balanced => {
                ordered.sort_by(|a, b| {
                    balanced_weight(b, now)
                        .partial_cmp(&balanced_weight(a, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        let mut parts: Vec<&str> = Vec::new();
        let mut used = 0usize;
        for entry in ordered {
            if used + entry.tokens > max_tokens {
                continue;
            }
            used += entry.tokens;
            parts.push(&entry.content);
        }
        Ok(parts.join("\n\n"))
    }

    /// Parse and validate a strategy string from the API boundary.
    pub fn parse_strategy(s: &str) -> EngineResult<ContextStrategy> {
        ContextStrategy::parse(s).ok_or_else(|| {
            EngineError::validation(
                "strategy",
                format!("unknown context strategy {s:?} (expected recent|frequent|balanced)"),
            )
        })
    }
}

/// LFU+LRU hybrid: frequency discounted by age. Lower is evicted first.
fn eviction_score(entry: &WorkingEntry, now: DateTime<Utc>) -> f64 {
    let age_secs = (now - entry.last_accessed).num_seconds().max(0) as f64;
    entry.access_count as f64 / (1.0 + age_secs)
}

/// Balanced assembly weight: importance discounted by age in days.
fn balanced_weight(entry: &WorkingEntry, now: DateTime<Utc>) -> f64 {
    let age_days = ((now - entry.inserted_at).num_seconds().max(0) as f64 / 86_400.0).max(1e-6);
    entry.importance / age_days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn wm(budget: usize) -> WorkingMemory {
        WorkingMemory::new(budget)
    }

    fn backdate(memory: &mut WorkingMemory, node_id: i64, secs: i64) {
        let entry = memory
            .entries
            .iter_mut()
            .find(|e| e.node_id == node_id)
            .expect("entry");
        entry.last_accessed = entry.last_accessed - Duration::seconds(secs);
        entry.inserted_at = entry.inserted_at - Duration::seconds(secs);
    }

    #[test]
    fn test_add_accounts_tokens() {
        let mut m = wm(100);
        m.add(1, "alpha".into(), 40, 0, 1.0, false);
        m.add(2, "beta".into(), 40, 0, 1.0, false);
        assert_eq!(m.token_usage(), 80);
        assert!(m.has_space(20));
        assert!(!m.has_space(21));
    }

    #[test]
    fn test_add_overwrites_same_node() {
        let mut m = wm(100);
        m.add(1, "v1".into(), 40, 0, 1.0, false);
        m.add(1, "v2".into(), 30, 2, 1.0, false);
        assert_eq!(m.len(), 1);
        assert_eq!(m.token_usage(), 30);
        assert_eq!(m.entries()[0].content, "v2");
    }

    #[test]
    fn test_eviction_removes_lowest_score() {
        let mut m = wm(100);
        m.add(1, "old and idle".into(), 40, 0, 1.0, false);
        m.add(2, "hot".into(), 40, 5, 1.0, false);
        // Node 1 is older and never accessed → lowest score.
        backdate(&mut m, 1, 3600);

        let evicted = m.evict_to_make_space(40);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].node_id, 1);
        assert!(m.has_space(40));
        assert!(m.contains(2));
    }

    #[test]
    fn test_eviction_tie_breaks_on_older_access() {
        let mut m = wm(80);
        m.add(1, "a".into(), 40, 0, 1.0, false);
        m.add(2, "b".into(), 40, 0, 1.0, false);
        backdate(&mut m, 1, 7200);
        backdate(&mut m, 2, 3600);
        // Both scores are ~0; the older access (node 1) must go first.
        let evicted = m.evict_to_make_space(40);
        assert_eq!(evicted[0].node_id, 1);
    }

    #[test]
    fn test_eviction_frees_until_enough() {
        let mut m = wm(100);
        for id in 1..=3 {
            m.add(id, format!("chunk {id}"), 33, 0, 1.0, false);
        }
        let evicted = m.evict_to_make_space(70);
        assert_eq!(evicted.len(), 2);
        assert!(m.has_space(70));
    }

    #[test]
    fn test_oversized_request_evicts_nothing() {
        let mut m = wm(50);
        m.add(1, "keep".into(), 30, 0, 1.0, false);
        let evicted = m.evict_to_make_space(60);
        assert!(evicted.is_empty());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_touch_updates_counters() {
        let mut m = wm(100);
        m.add(1, "note".into(), 10, 0, 1.0, false);
        m.touch(1);
        m.touch(1);
        assert_eq!(m.entries()[0].access_count, 2);
    }

    #[test]
    fn test_assemble_recent_order() {
        let mut m = wm(1000);
        m.add(1, "first".into(), 10, 0, 1.0, false);
        m.add(2, "second".into(), 10, 0, 1.0, false);
        backdate(&mut m, 1, 120);

        let ctx = m.assemble_context(ContextStrategy::Recent, 1000).unwrap();
        assert_eq!(ctx, "second\n\nfirst");
    }

    #[test]
    fn test_assemble_frequent_order() {
        let mut m = wm(1000);
        m.add(1, "rare".into(), 10, 1, 1.0, false);
        m.add(2, "common".into(), 10, 9, 1.0, false);

        let ctx = m.assemble_context(ContextStrategy::Frequent, 1000).unwrap();
        assert_eq!(ctx, "common\n\nrare");
    }

    #[test]
    fn test_assemble_balanced_prefers_important_fresh() {
        let mut m = wm(1000);
        m.add(1, "old important".into(), 10, 0, 5.0, false);
        m.add(2, "fresh default".into(), 10, 0, 1.0, false);
        // A week old: weight 5/7 < 1/(tiny age) of the fresh entry.
        backdate(&mut m, 1, 7 * 86_400);

        let ctx = m.assemble_context(ContextStrategy::Balanced, 1000).unwrap();
        assert_eq!(ctx, "fresh default\n\nold important");
    }

    #[test]
    fn test_assemble_respects_budget() {
        let mut m = wm(1000);
        m.add(1, "big".into(), 90, 0, 1.0, false);
        m.add(2, "small".into(), 10, 0, 1.0, false);
        backdate(&mut m, 2, 60);

        // Only the newest (big) fits; small would overflow — unless big is
        // skipped first. Budget 50 admits only "small".
        let ctx = m.assemble_context(ContextStrategy::Recent, 50).unwrap();
        assert_eq!(ctx, "small");
    }

    #[test]
    fn test_parse_strategy_rejects_unknown() {
        assert!(WorkingMemory::parse_strategy("recent").is_ok());
        let err = WorkingMemory::parse_strategy("chronological").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_clear() {
        let mut m = wm(100);
        m.add(1, "x".into(), 10, 0, 1.0, false);
        let dropped = m.clear();
        assert_eq!(dropped.len(), 1);
        assert!(m.is_empty());
        assert_eq!(m.token_usage(), 0);
    }
}
