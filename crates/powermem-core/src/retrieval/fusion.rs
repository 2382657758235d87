//! Score fusion across retrieval branches (spec.md §4.5 "Fusion"), extended
//! to a three-branch (vector, text, graph) form of the teacher's two-branch
//! `search::hybrid` RRF/weighted combinators.

use std::collections::HashMap;

/// One branch's ranked output: ids best-first, plus that branch's own
/// normalized `[0, 1]` score per id (used only by [`linear_combination`]).
pub struct BranchResult {
    pub ranked_ids: Vec<String>,
    pub scores: HashMap<String, f32>,
}

impl BranchResult {
    pub fn empty() -> Self {
        Self { ranked_ids: Vec::new(), scores: HashMap::new() }
    }

    pub fn from_scored(mut items: Vec<(String, f32)>) -> Self {
        items.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let ranked_ids = items.iter().map(|(id, _)| id.clone()).collect();
        let scores = items.into_iter().collect();
        Self { ranked_ids, scores }
    }
}

/// `score(id) = Σ_branch 1 / (rrf_k + rank_branch(id))`, `rank_branch` is
/// 1-based; branches that don't contain `id` contribute 0.
pub fn reciprocal_rank_fusion(branches: &[BranchResult], rrf_k: f32) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for branch in branches {
        for (rank, id) in branch.ranked_ids.iter().enumerate() {
            let contribution = 1.0 / (rrf_k + (rank as f32 + 1.0));
            *scores.entry(id.clone()).or_insert(0.0) += contribution;
        }
    }
    scores
}

/// `score(id) = Σ_branch w_branch · normalized_score_branch(id)`. Missing
/// branches/ids contribute 0. `weights` must align positionally with
/// `branches`.
pub fn linear_combination(branches: &[BranchResult], weights: &[f32]) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for (branch, weight) in branches.iter().zip(weights.iter()) {
        for id in &branch.ranked_ids {
            let s = branch.scores.get(id).copied().unwrap_or(0.0);
            *scores.entry(id.clone()).or_insert(0.0) += weight * s;
        }
    }
    scores
}
