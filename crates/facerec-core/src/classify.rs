//! Nearest-match classification over a sample-set snapshot.
//!
//! Ranks every sample by squared Euclidean distance to the query, takes the
//! nearest ten, and votes by category: most hits wins, ties between
//! categories fall back to the smaller nearest-hit distance, then to the
//! lower first-hit sample index. Exact distance ties between samples are
//! broken by the lower sample index, so the result is fully deterministic
//! for a fixed snapshot and query.

use crate::types::{Descriptor, Sample};
use std::collections::HashMap;

/// Number of nearest samples that take part in the vote.
const NEIGHBORHOOD: usize = 10;

/// Per-category vote accumulator.
struct CategoryHits {
    hits: usize,
    /// Distance of this category's nearest hit.
    best_distance: f32,
    /// Sample index of this category's nearest hit; final tie-break.
    first_index: usize,
}

/// Classify `query` against the snapshot; `None` means no match.
///
/// An empty snapshot always reports no match. No acceptance cutoff is
/// applied; use [`classify_with_threshold`] for one.
pub fn classify(samples: &[Sample], query: &Descriptor) -> Option<i32> {
    classify_with_threshold(samples, query, f32::INFINITY)
}

/// Classify `query`, excluding samples whose squared Euclidean distance
/// exceeds `max_squared_distance` before the vote. Returns `None` when the
/// snapshot is empty or every sample is beyond the cutoff.
pub fn classify_with_threshold(
    samples: &[Sample],
    query: &Descriptor,
    max_squared_distance: f32,
) -> Option<i32> {
    if samples.is_empty() {
        return None;
    }

    let mut ranked: Vec<(usize, f32)> = samples
        .iter()
        .enumerate()
        .map(|(idx, s)| (idx, s.descriptor.squared_distance(query)))
        .filter(|&(_, dist)| dist <= max_squared_distance)
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut hits_by_category: HashMap<i32, CategoryHits> = HashMap::new();
    for &(idx, dist) in ranked.iter().take(NEIGHBORHOOD) {
        let category = samples[idx].category;
        hits_by_category
            .entry(category)
            .and_modify(|h| h.hits += 1)
            .or_insert(CategoryHits { hits: 1, best_distance: dist, first_index: idx });
    }

    hits_by_category
        .into_iter()
        .min_by(|(_, a), (_, b)| {
            b.hits
                .cmp(&a.hits)
                .then(a.best_distance.total_cmp(&b.best_distance))
                .then(a.first_index.cmp(&b.first_index))
        })
        .map(|(category, _)| category)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(first: f32, category: i32) -> Sample {
        let mut d = Descriptor::zeroed();
        d.0[0] = first;
        Sample::new(d, category)
    }

    fn query_at(first: f32) -> Descriptor {
        let mut d = Descriptor::zeroed();
        d.0[0] = first;
        d
    }

    #[test]
    fn test_empty_snapshot_is_no_match() {
        assert_eq!(classify(&[], &query_at(0.0)), None);
    }

    #[test]
    fn test_single_sample_matches() {
        let samples = vec![sample_at(1.0, 7)];
        assert_eq!(classify(&samples, &query_at(0.9)), Some(7));
    }

    #[test]
    fn test_nearest_category_wins() {
        let samples = vec![sample_at(5.0, 1), sample_at(0.1, 2)];
        assert_eq!(classify(&samples, &query_at(0.0)), Some(2));
    }

    #[test]
    fn test_majority_vote_beats_single_nearer_hit() {
        // Category 2 contributes two neighbors, category 1 only the single
        // nearest one; the vote goes to 2.
        let samples = vec![
            sample_at(0.10, 1),
            sample_at(0.20, 2),
            sample_at(0.25, 2),
        ];
        assert_eq!(classify(&samples, &query_at(0.0)), Some(2));
    }

    #[test]
    fn test_equal_hits_prefer_smaller_distance() {
        let samples = vec![
            sample_at(0.30, 1),
            sample_at(0.10, 2),
            sample_at(0.40, 1),
            sample_at(0.50, 2),
        ];
        // Both categories have 2 hits; category 2's nearest hit is closer.
        assert_eq!(classify(&samples, &query_at(0.0)), Some(2));
    }

    #[test]
    fn test_exact_tie_breaks_by_lowest_sample_index() {
        let samples = vec![sample_at(0.5, 9), sample_at(0.5, 4)];
        assert_eq!(classify(&samples, &query_at(0.0)), Some(9));
    }

    #[test]
    fn test_only_nearest_ten_vote() {
        // Eleven samples of category 1 farther away than ten of category 2:
        // category 1 never enters the neighborhood.
        let mut samples: Vec<Sample> = (0..10).map(|i| sample_at(0.1 + i as f32 * 0.01, 2)).collect();
        samples.extend((0..11).map(|i| sample_at(1.0 + i as f32 * 0.01, 1)));
        assert_eq!(classify(&samples, &query_at(0.0)), Some(2));
    }

    #[test]
    fn test_threshold_excludes_far_samples() {
        let samples = vec![sample_at(2.0, 1)];
        // Squared distance is 4.0, above the cutoff.
        assert_eq!(classify_with_threshold(&samples, &query_at(0.0), 0.36), None);
        assert_eq!(classify_with_threshold(&samples, &query_at(0.0), 5.0), Some(1));
    }

    #[test]
    fn test_threshold_filters_before_vote() {
        // Two far category-1 samples would outvote the close category-2 one,
        // but the cutoff removes them first.
        let samples = vec![
            sample_at(0.1, 2),
            sample_at(1.5, 1),
            sample_at(1.6, 1),
        ];
        assert_eq!(classify_with_threshold(&samples, &query_at(0.0), 1.0), Some(2));
        assert_eq!(classify(&samples, &query_at(0.0)), Some(1));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let samples: Vec<Sample> =
            (0..30).map(|i| sample_at(i as f32 * 0.05, i % 3)).collect();
        let query = query_at(0.42);
        let first = classify(&samples, &query);
        for _ in 0..10 {
            assert_eq!(classify(&samples, &query), first);
        }
    }

    #[test]
    fn test_opaque_category_ids() {
        // Category IDs are opaque: large and negative values work.
        let samples = vec![sample_at(0.1, i32::MAX), sample_at(5.0, -42)];
        assert_eq!(classify(&samples, &query_at(0.0)), Some(i32::MAX));
        assert_eq!(classify(&samples, &query_at(5.0)), Some(-42));
    }
}
