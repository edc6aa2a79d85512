// ── Mnemo Engine: Token Counter ─────────────────────────────────────────────
//
// Single source of truth for token estimation across the substrate. The
// working-memory accountant, the context assembler, and the store all go
// through `Tokenizer::count()` — no manual `len / 4` division anywhere.
//
// Strategy:
//   1. For known model families, use the measured chars-per-token ratio.
//   2. For unknown models, use a safe heuristic (chars / 3.5).
//   3. A `Custom` variant accepts an injected counting function so hosts can
//      plug an exact tokenizer without the crate growing a model dependency.

use std::fmt;
use std::sync::Arc;

/// Built-in estimation families. Ratios are for English prose; the counts are
/// only used for capacity accounting, where a ±10% margin is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// GPT-4 / Claude 3.x class vocabularies: ~3.7 chars/token.
    Cl100kBase,
    /// o-series / coarser vocabularies: ~3.9 chars/token.
    O200kBase,
    /// SentencePiece (Llama, Mistral): ~3.3 chars/token.
    SentencePiece,
    /// Conservative fallback: 3.5 chars/token (overestimates slightly = safe).
    Heuristic,
}

/// Deterministic text → token estimate.
#[derive(Clone)]
pub struct Tokenizer {
    inner: TokenizerImpl,
}

#[derive(Clone)]
enum TokenizerImpl {
    Ratio { kind: TokenizerKind, chars_per_token: f32 },
    Custom(Arc<dyn Fn(&str) -> usize + Send + Sync>),
}

impl Tokenizer {
    /// Create a tokenizer from a known family.
    pub fn new(kind: TokenizerKind) -> Self {
        let cpt = match kind {
            TokenizerKind::Cl100kBase => 3.7,
            TokenizerKind::O200kBase => 3.9,
            TokenizerKind::SentencePiece => 3.3,
            TokenizerKind::Heuristic => 3.5,
        };
        Self { inner: TokenizerImpl::Ratio { kind, chars_per_token: cpt } }
    }

    /// Create a heuristic tokenizer (safe default).
    pub fn heuristic() -> Self {
        Self::new(TokenizerKind::Heuristic)
    }

    /// Wrap an injected counting function (e.g. an exact BPE tokenizer).
    /// The function must be pure: same text, same count.
    pub fn custom(f: impl Fn(&str) -> usize + Send + Sync + 'static) -> Self {
        Self { inner: TokenizerImpl::Custom(Arc::new(f)) }
    }

    /// Estimate the number of tokens in a string. Non-empty text is always
    /// at least one token.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match &self.inner {
            TokenizerImpl::Ratio { chars_per_token, .. } => {
                // Char count, not byte count — byte count would overcount
                // CJK/emoji text.
                let chars = text.chars().count();
                ((chars as f32 / chars_per_token).ceil() as usize).max(1)
            }
            TokenizerImpl::Custom(f) => f(text).max(1),
        }
    }

    /// Estimate how many characters fit in a given token budget.
    /// Useful for pre-allocating string capacity during context assembly.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        match &self.inner {
            TokenizerImpl::Ratio { chars_per_token, .. } => {
                (tokens as f32 * chars_per_token) as usize
            }
            // No ratio available for custom counters; assume the fallback.
            TokenizerImpl::Custom(_) => (tokens as f32 * 3.5) as usize,
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::heuristic()
    }
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            TokenizerImpl::Ratio { kind, .. } => write!(f, "Tokenizer({kind:?})"),
            TokenizerImpl::Custom(_) => write!(f, "Tokenizer(custom)"),
        }
    }
}
