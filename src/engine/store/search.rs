// ── Mnemo Store: Retrieval Queries ──────────────────────────────────────────
//
// The SQL legs of the three hybrid-recall retrievers. Each returns at most
// `limit` candidates with its native score; ranking, normalization, and RRF
// fusion happen in engine/recall.rs.
//
//   vector    — brute-force cosine over non-null embeddings (candidate sets
//               are bounded, so a scan beats maintaining an ANN index here)
//   fulltext  — FTS5 MATCH with BM25 rank (negated so bigger is better)
//   tags      — nodes carrying any of the expanded tag names, grouped per node
//
// Timeframe filters are half-open `[start, end)` on created_at. The bounds
// are always bound as RFC 3339 strings; "no filter" uses sentinel bounds so
// every statement stays static.

use super::embedding::{bytes_to_f32_vec, cosine_similarity};
use super::{ts_str, MemoryStore};
use crate::atoms::error::EngineResult;
use crate::atoms::types::TimeFrame;
use rusqlite::params;
use std::collections::HashSet;

/// Lower/upper sentinel bounds used when no timeframe is given. RFC 3339
/// strings compare lexicographically, so these bracket every real timestamp.
const TIME_MIN: &str = "0000-01-01T00:00:00.000Z";
const TIME_MAX: &str = "9999-12-31T23:59:59.999Z";

fn bounds(timeframe: Option<TimeFrame>) -> (String, String) {
    match timeframe {
        Some(tf) => (ts_str(tf.start), ts_str(tf.end)),
        None => (TIME_MIN.to_string(), TIME_MAX.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorCandidate {
    pub node_id: i64,
    /// Cosine similarity clamped to [0, 1].
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FulltextCandidate {
    pub node_id: i64,
    /// Negated BM25 score (positive, bigger is better).
    pub text_rank: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCandidate {
    pub node_id: i64,
    /// The node's tag names that matched the probe set, sorted.
    pub matched: Vec<String>,
}

/// Escape a user query for FTS5 MATCH: quote-escape, then OR the terms so
/// partial matches still rank.
fn fts_query(query: &str) -> String {
    query
        .replace('"', "\"\"")
        .split_whitespace()
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

impl MemoryStore {
    /// Cosine-similarity scan over embedded, live nodes.
    pub fn vector_candidates(
        &self,
        query_embedding: &[f32],
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        limit: usize,
    ) -> EngineResult<Vec<VectorCandidate>> {
        if query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = bounds(timeframe);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM nodes
             WHERE embedding IS NOT NULL AND deleted_at IS NULL
               AND created_at >= ?1 AND created_at < ?2",
        )?;

        let rows = stmt.query_map(params![start, end], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;

        let mut scored: Vec<VectorCandidate> = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            if let Some(scope) = scope {
                if !scope.contains(&id) {
                    continue;
                }
            }
            let stored = bytes_to_f32_vec(&blob);
            // Stored vectors are padded to a fixed width; pad the query to
            // match (zeros do not move the cosine).
            let sim = if stored.len() > query_embedding.len() {
                let padded = super::embedding::zero_pad(query_embedding.to_vec(), stored.len());
                cosine_similarity(&padded, &stored)
            } else {
                cosine_similarity(query_embedding, &stored)
            };
            let sim = sim.clamp(0.0, 1.0);
            if sim > 0.0 {
                scored.push(VectorCandidate { node_id: id, similarity: sim });
            }
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// BM25 full-text search via FTS5.
    pub fn fulltext_candidates(
        &self,
        query: &str,
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        limit: usize,
    ) -> EngineResult<Vec<FulltextCandidate>> {
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = bounds(timeframe);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT n.id, bm25(nodes_fts) AS score
             FROM nodes_fts
             JOIN nodes n ON n.id = nodes_fts.rowid
             WHERE nodes_fts MATCH ?1
               AND n.deleted_at IS NULL
               AND n.created_at >= ?2 AND n.created_at < ?3
             ORDER BY score
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(params![match_expr, start, end, limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let score: f64 = row.get(1)?;
            Ok((id, score))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, score) = row?;
            if let Some(scope) = scope {
                if !scope.contains(&id) {
                    continue;
                }
            }
            // FTS5 BM25 is smaller-is-better (usually negative); negate so
            // callers see a positive, bigger-is-better rank value.
            out.push(FulltextCandidate { node_id: id, text_rank: -score });
        }
        Ok(out)
    }

    /// Nodes carrying any of the probe tag names, with the matching names
    /// grouped per node. The probe set is the ancestor-expanded extraction.
    pub fn tag_candidates(
        &self,
        tag_names: &[String],
        timeframe: Option<TimeFrame>,
        scope: Option<&HashSet<i64>>,
        limit: usize,
    ) -> EngineResult<Vec<TagCandidate>> {
        if tag_names.is_empty() {
            return Ok(Vec::new());
        }
        let (start, end) = bounds(timeframe);
        let placeholders = vec!["?"; tag_names.len()].join(",");
        let sql = format!(
            "SELECT nt.node_id, t.name
             FROM node_tags nt
             JOIN tags t ON t.id = nt.tag_id
             JOIN nodes n ON n.id = nt.node_id
             WHERE t.name IN ({placeholders})
               AND n.deleted_at IS NULL
               AND n.created_at >= ? AND n.created_at < ?
             ORDER BY nt.node_id, t.name"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut bind: Vec<String> = tag_names.to_vec();
        bind.push(start);
        bind.push(end);

        let rows = stmt.query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out: Vec<TagCandidate> = Vec::new();
        for row in rows {
            let (node_id, name) = row?;
            if let Some(scope) = scope {
                if !scope.contains(&node_id) {
                    continue;
                }
            }
            match out.last_mut() {
                Some(last) if last.node_id == node_id => last.matched.push(name),
                _ => {
                    if out.len() >= limit {
                        break;
                    }
                    out.push(TagCandidate { node_id, matched: vec![name] });
                }
            }
        }
        Ok(out)
    }
}
