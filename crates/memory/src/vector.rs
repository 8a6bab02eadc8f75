//! Similarity and hybrid scoring.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity, and its mapping into [0, 1]
//! - Keyword overlap between a query and a record's text
//! - The weighted hybrid score used to rank search results

use std::collections::BTreeSet;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the vectors differ in length, are empty, or either is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0) as f32
}

/// Cosine similarity mapped linearly from [-1, 1] onto [0, 1].
pub fn semantic_similarity(a: &[f32], b: &[f32]) -> f32 {
    (cosine_similarity(a, b) + 1.0) / 2.0
}

/// Distinct lower-cased, whitespace-separated query tokens.
pub fn query_keywords(query: &str) -> BTreeSet<String> {
    query
        .split_whitespace()
        .map(|token| token.to_lowercase())
        .collect()
}

/// Fraction of `keywords` that occur in `text` (case-insensitive).
///
/// An empty keyword set overlaps nothing.
pub fn keyword_overlap(keywords: &BTreeSet<String>, text: &str) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|kw| haystack.contains(kw.as_str()))
        .count();
    hits as f32 / keywords.len() as f32
}

/// Relative weights of the semantic and keyword components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub semantic: f32,
    pub keyword: f32,
}

impl ScoreWeights {
    /// Build weights normalised to sum to 1. Non-positive totals fall back
    /// to the defaults.
    pub fn new(semantic: f32, keyword: f32) -> Self {
        let semantic = semantic.max(0.0);
        let keyword = keyword.max(0.0);
        let total = semantic + keyword;
        if total <= f32::EPSILON {
            return Self::default();
        }
        Self {
            semantic: semantic / total,
            keyword: keyword / total,
        }
    }

    /// Combine the two components.
    pub fn combine(&self, semantic: f32, keyword: f32) -> f32 {
        self.semantic * semantic + self.keyword * keyword
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.7,
            keyword: 0.3,
        }
    }
}
