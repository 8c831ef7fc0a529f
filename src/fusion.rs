//! Reciprocal Rank Fusion.
//!
//! Combines rankings from the dense-vector and BM25 channels without score
//! normalization: each item's fused score is `Σ 1/(60 + rank_i)` over the
//! rankings that contain it (1-based ranks; a missing rank contributes 0).

/// RRF constant from the literature.
pub const RRF_K: f64 = 60.0;

/// Fuse rankings of chunk ids into a single ordering.
///
/// Returns `(chunk_id, rrf_score)` pairs sorted by score descending, ties
/// broken by chunk id ascending so the output is deterministic.
pub fn reciprocal_rank_fusion(rankings: &[Vec<i64>]) -> Vec<(i64, f64)> {
    use std::collections::HashMap;

    let mut scores: HashMap<i64, f64> = HashMap::new();
    // First-appearance order keeps iteration independent of hash layout.
    let mut order: Vec<i64> = Vec::new();

    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            let entry = scores.entry(*id).or_insert_with(|| {
                order.push(*id);
                0.0
            });
            *entry += 1.0 / (RRF_K + (rank + 1) as f64);
        }
    }

    let mut fused: Vec<(i64, f64)> = order.into_iter().map(|id| (id, scores[&id])).collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}
