// ── Mnemo Engine: Tag Ontology ──────────────────────────────────────────────
//
// Hierarchical topic labels: lowercase `[a-z0-9-]+` segments joined by `:`,
// one to five levels. The ontology is materialized — every ancestor of a
// stored tag has its own row, and tagging a node with `a:b:c` associates the
// node with `a`, `a:b`, and `a:b:c`.
//
// This module owns:
//   - name validation and hierarchy parsing (pure)
//   - trigram similarity for fuzzy search (pg_trgm semantics, computed here
//     because the store is SQLite)
//   - store-backed find-or-create with ancestor materialization
//   - fuzzy and prefix search over the tag namespace

use crate::atoms::constants::{TAG_FUZZY_MIN_SIMILARITY, TAG_MAX_DEPTH};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Tag, TagHierarchy};
use crate::engine::store::MemoryStore;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("segment regex"));

// ═══════════════════════════════════════════════════════════════════════════
// Pure helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Validate a tag name: 1–5 lowercase `[a-z0-9-]+` segments joined by `:`,
/// no duplicate segments, no segment containing another.
pub fn is_valid(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let segments: Vec<&str> = name.split(':').collect();
    if segments.is_empty() || segments.len() > TAG_MAX_DEPTH {
        return false;
    }
    for seg in &segments {
        if !SEGMENT_RE.is_match(seg) {
            return false;
        }
    }
    // Reject duplicate or self-containing segments ("a:a", "dev:devops").
    for (i, a) in segments.iter().enumerate() {
        for b in segments.iter().skip(i + 1) {
            if a == b || a.contains(b) || b.contains(a) {
                return false;
            }
        }
    }
    true
}

/// All ancestors of a name, shallow to deep, including the name itself:
/// `"a:b:c"` → `["a", "a:b", "a:b:c"]`. The name is not validated here.
pub fn ancestors(name: &str) -> Vec<String> {
    let segments: Vec<&str> = name.split(':').collect();
    let mut out = Vec::with_capacity(segments.len());
    for depth in 1..=segments.len() {
        out.push(segments[..depth].join(":"));
    }
    out
}

/// Parse a valid name into its hierarchy shape. Returns None for invalid
/// names.
pub fn parse_hierarchy(name: &str) -> Option<TagHierarchy> {
    if !is_valid(name) {
        return None;
    }
    let levels: Vec<String> = name.split(':').map(str::to_string).collect();
    let depth = levels.len();
    let parent = if depth > 1 {
        Some(levels[..depth - 1].join(":"))
    } else {
        None
    };
    Some(TagHierarchy {
        full: name.to_string(),
        root: levels[0].clone(),
        parent,
        levels,
        depth,
    })
}

/// Trigram similarity between two strings, pg_trgm style: pad with two
/// leading and one trailing space, take 3-grams, Jaccard over the sets.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn trigrams(s: &str) -> HashSet<[char; 3]> {
    let lower = s.to_lowercase();
    let mut set = HashSet::new();
    // pg_trgm treats each word independently; tag names use `:` and `-` as
    // word breaks.
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars())
            .chain(" ".chars())
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

// ═══════════════════════════════════════════════════════════════════════════
// Store-backed engine
// ═══════════════════════════════════════════════════════════════════════════

/// Tag operations over the shared store.
#[derive(Clone)]
pub struct TagEngine {
    store: Arc<MemoryStore>,
}

impl TagEngine {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Ensure a tag and every ancestor exist; returns the full chain,
    /// shallow to deep. Invalid names fail with a `Validation` error.
    pub fn find_or_create_with_ancestors(&self, name: &str) -> EngineResult<Vec<Tag>> {
        if !is_valid(name) {
            return Err(EngineError::validation("tag", format!("invalid tag name: {name:?}")));
        }
        let mut chain = Vec::new();
        for ancestor in ancestors(name) {
            chain.push(self.store.find_or_create_tag(&ancestor)?);
        }
        Ok(chain)
    }

    /// Associate each valid name (with its ancestors) to a node. Shared
    /// ancestors across names are applied once; invalid names are skipped
    /// and reported in the second element. Returns (applied, skipped).
    pub fn add_tags_to_node(
        &self,
        node_id: i64,
        names: &[String],
    ) -> EngineResult<(Vec<String>, Vec<String>)> {
        let mut applied: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut skipped: Vec<String> = Vec::new();

        for name in names {
            let name = name.trim().to_lowercase();
            if !is_valid(&name) {
                skipped.push(name);
                continue;
            }
            for tag in self.find_or_create_with_ancestors(&name)? {
                if seen.insert(tag.name.clone()) {
                    self.store.associate_tag(node_id, tag.id)?;
                    applied.push(tag.name);
                }
            }
        }
        applied.sort();
        Ok((applied, skipped))
    }

    /// Remove one node ↔ tag association. Descendant and ancestor
    /// associations are left alone.
    pub fn remove_tag_from_node(&self, node_id: i64, name: &str) -> EngineResult<()> {
        let tag = self
            .store
            .tag_by_name(name)?
            .ok_or_else(|| EngineError::not_found("tag", name))?;
        self.store.dissociate_tag(node_id, tag.id)
    }

    /// Trigram-similarity search over all tag names, best first.
    pub fn search_fuzzy(
        &self,
        query: &str,
        min_similarity: Option<f64>,
        limit: usize,
    ) -> EngineResult<Vec<(String, f64)>> {
        let floor = min_similarity.unwrap_or(TAG_FUZZY_MIN_SIMILARITY);
        let mut scored: Vec<(String, f64)> = self
            .store
            .all_tag_names()?
            .into_iter()
            .filter_map(|name| {
                let sim = trigram_similarity(query, &name);
                (sim >= floor).then_some((name, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Hierarchical prefix match: `"dev"` matches `"dev"` and `"dev:ops"`
    /// but never `"devops"`.
    pub fn search_prefix(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let raw = self.store.tag_names_like(prefix)?;
        let boundary = format!("{prefix}:");
        Ok(raw
            .into_iter()
            .filter(|name| name == prefix || name.starts_with(&boundary))
            .collect())
    }

    /// Expand a set of extracted tag names into every distinct ancestor.
    /// The probe set the tag retriever queries with.
    pub fn expand_ancestors(names: &[String]) -> Vec<String> {
        let mut set: HashSet<String> = HashSet::new();
        for name in names {
            for ancestor in ancestors(name) {
                set.insert(ancestor);
            }
        }
        let mut out: Vec<String> = set.into_iter().collect();
        out.sort();
        out
    }
}
