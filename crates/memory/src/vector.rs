//! Vector similarity and ranking utilities.
//!
//! Pure-Rust implementations of:
//! - Cosine similarity
//! - Dot product
//! - Stable top-K ranking of records against a query vector

use rustedkernel_core::memory::{MemoryRecord, SearchFilter, SearchHit, SimilarityMetric};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
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

    (dot / denom) as f32
}

/// Dot product of two equal-length vectors; 0.0 on length mismatch.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum::<f64>() as f32
}

/// Score `candidate` against `query` with the given metric.
pub fn similarity(metric: SimilarityMetric, query: &[f32], candidate: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine_similarity(query, candidate),
        SimilarityMetric::DotProduct => dot_product(query, candidate),
    }
}

/// Rank records by similarity to `query`.
///
/// `records` must be in insertion order: the sort is stable, so equal
/// scores keep that order. Records failing `filter`, scoring below
/// `min_score` or producing a non-finite score are skipped.
pub fn rank<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    query: &[f32],
    metric: SimilarityMetric,
    top_k: usize,
    filter: Option<&SearchFilter>,
    min_score: Option<f32>,
) -> Vec<SearchHit> {
    let mut scored: Vec<SearchHit> = records
        .into_iter()
        .filter(|record| filter.is_none_or(|f| f.matches(record)))
        .filter_map(|record| {
            let score = similarity(metric, query, &record.vector);
            if !score.is_finite() || min_score.is_some_and(|min| score < min) {
                return None;
            }
            Some(SearchHit {
                record: record.clone(),
                score,
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}
