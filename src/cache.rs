//! Similarity cache over the global result store
//!
//! A parameter vector that is close enough to one already evaluated reuses the
//! stored raw metrics instead of paying for layout generation and evaluation.
//!
//! ## Scoring
//!
//! Each candidate is scored by cosine similarity to the query. A hard
//! per-coordinate gate is layered on top: if any coordinate differs from the
//! query by more than `max_error_fraction * |query_i|`, [`GATE_PENALTY`] is
//! subtracted from the candidate's score. Penalized scores stay finite and
//! still take part in the argmax; they can simply never reach a threshold.
//!
//! ## Staleness
//!
//! Lookups scan an in-memory snapshot of the store, reloaded every
//! `refresh_interval` lookups (0 = every lookup). Hits return raw metrics, not
//! the stored reward, because weights change between scalarization passes.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::reward::is_penalty;
use crate::store::{ResultRecord, ResultStore};
use crate::Result;

/// Amount subtracted from a candidate's score when it fails the tolerance gate.
pub const GATE_PENALTY: f64 = 999_999.0;

/// Cosine similarity of two equal-length vectors, clamped into `[-1, 1]`.
///
/// A zero-norm vector has similarity 0 with everything.
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b).sqrt()).clamp(-1.0, 1.0)
}

/// Cosine similarity with the per-coordinate tolerance gate applied.
///
/// `query` supplies the reference magnitudes. Vectors of different length
/// score `f64::NEG_INFINITY` and never win.
#[must_use]
pub fn gated_similarity(query: &[f64], candidate: &[f64], max_error_fraction: f64) -> f64 {
    if query.len() != candidate.len() {
        return f64::NEG_INFINITY;
    }
    let out_of_tolerance = query
        .iter()
        .zip(candidate)
        .any(|(&q, &c)| (q - c).abs() > max_error_fraction * q.abs());
    let similarity = cosine_similarity(query, candidate);
    if out_of_tolerance {
        similarity - GATE_PENALTY
    } else {
        similarity
    }
}

/// One cached evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Evaluated parameter vector
    pub params: Vec<f64>,
    /// Raw metrics reported for it
    pub raw_metrics: Vec<f64>,
}

impl From<ResultRecord> for CacheEntry {
    fn from(record: ResultRecord) -> Self {
        Self {
            params: record.params().to_vec(),
            raw_metrics: record.raw_metrics().to_vec(),
        }
    }
}

/// Accepted cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// Parameters of the matched evaluation
    pub params: Vec<f64>,
    /// Raw metrics of the matched evaluation
    pub raw_metrics: Vec<f64>,
    /// Score of the match
    pub similarity: f64,
}

/// Nearest-neighbour cache over a store snapshot.
#[derive(Debug, Clone)]
pub struct SimilarityCache {
    threshold: f64,
    max_error_fraction: f64,
    refresh_interval: u64,
    lookups: u64,
    snapshot: Vec<CacheEntry>,
}

impl SimilarityCache {
    /// Create an empty cache.
    #[must_use]
    pub const fn new(threshold: f64, max_error_fraction: f64, refresh_interval: u64) -> Self {
        Self {
            threshold,
            max_error_fraction,
            refresh_interval,
            lookups: 0,
            snapshot: Vec::new(),
        }
    }

    /// Create an empty cache from configuration.
    #[must_use]
    pub const fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.similarity_threshold,
            config.max_error_fraction,
            config.refresh_interval,
        )
    }

    /// Number of entries in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    /// Replace the snapshot. Penalty substitutes are not real measurements
    /// and are left out.
    pub fn load(&mut self, entries: impl IntoIterator<Item = CacheEntry>) {
        self.snapshot = entries
            .into_iter()
            .filter(|entry| !is_penalty(&entry.raw_metrics))
            .collect();
    }

    /// Reload the snapshot from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn refresh(&mut self, store: &ResultStore) -> Result<()> {
        let records = store.read_all()?;
        self.load(records.into_iter().map(CacheEntry::from));
        debug!(entries = self.snapshot.len(), "similarity cache refreshed");
        Ok(())
    }

    /// Whether the next lookup reloads the snapshot.
    #[must_use]
    pub const fn refresh_due(&self) -> bool {
        self.refresh_interval == 0 || self.lookups % self.refresh_interval == 0
    }

    /// Look `query` up, reloading the snapshot from `store` when due.
    ///
    /// # Errors
    ///
    /// Returns an error if a due reload fails.
    pub fn lookup(&mut self, store: &ResultStore, query: &[f64]) -> Result<Option<CacheHit>> {
        if self.refresh_due() {
            self.refresh(store)?;
        }
        self.lookups += 1;
        Ok(self.best_match(query))
    }

    /// Best match for `query` in the current snapshot, if it clears the
    /// threshold. Ties keep the earliest entry.
    #[must_use]
    pub fn best_match(&self, query: &[f64]) -> Option<CacheHit> {
        let scores: Vec<f64> = self
            .snapshot
            .par_iter()
            .map(|entry| gated_similarity(query, &entry.params, self.max_error_fraction))
            .collect();

        let (index, score) = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, score)| !score.is_nan())
            .fold(None, |best: Option<(usize, f64)>, (i, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((i, score)),
            })?;

        trace!(index, score, "closest cached parameters");
        if score >= self.threshold {
            let entry = &self.snapshot[index];
            Some(CacheHit {
                params: entry.params.clone(),
                raw_metrics: entry.raw_metrics.clone(),
                similarity: score,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::penalty_metrics;

    fn entry(params: &[f64], first_metric: f64) -> CacheEntry {
        let mut raw_metrics = vec![0.5; 7];
        raw_metrics[0] = first_metric;
        CacheEntry {
            params: params.to_vec(),
            raw_metrics,
        }
    }

    #[test]
    fn test_cosine_identical_is_one() {
        let v = [1.3, 0.7, 120.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_gate_subtracts_penalty_once() {
        let score = gated_similarity(&[1.0, 1.0, 1.0], &[2.0, 2.0, 2.0], 0.05);
        assert!((score - (1.0 - GATE_PENALTY)).abs() < 1e-6);
    }

    #[test]
    fn test_length_mismatch_never_wins() {
        assert_eq!(gated_similarity(&[1.0], &[1.0, 2.0], 0.5), f64::NEG_INFINITY);
    }

    #[test]
    fn test_best_match_prefers_highest_score() {
        let mut cache = SimilarityCache::new(0.9, 0.1, 0);
        cache.load(vec![entry(&[1.0, 2.0, 60.0], 0.1), entry(&[1.0, 2.0, 50.5], 0.2)]);

        let hit = cache.best_match(&[1.0, 2.0, 50.0]).unwrap();
        assert_eq!(hit.params, vec![1.0, 2.0, 50.5]);
        assert!((hit.raw_metrics[0] - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_best_match_below_threshold_is_none() {
        let mut cache = SimilarityCache::new(0.9, 0.01, 0);
        cache.load(vec![entry(&[1.0, 2.0, 60.0], 0.1)]);
        assert!(cache.best_match(&[1.0, 2.0, 50.0]).is_none());
    }

    #[test]
    fn test_empty_snapshot_is_none() {
        let cache = SimilarityCache::new(0.0, 1.0, 0);
        assert!(cache.best_match(&[1.0]).is_none());
    }

    #[test]
    fn test_penalty_rows_are_not_cached() {
        let mut cache = SimilarityCache::new(0.5, 0.5, 0);
        cache.load(vec![CacheEntry {
            params: vec![1.0, 2.0, 3.0],
            raw_metrics: penalty_metrics(),
        }]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_refresh_due_every_n_lookups() {
        let store = ResultStore::open_in_memory().unwrap();
        let mut cache = SimilarityCache::new(0.9, 0.1, 3);
        let mut due = Vec::new();
        for _ in 0..6 {
            due.push(cache.refresh_due());
            cache.lookup(&store, &[1.0]).unwrap();
        }
        assert_eq!(due, vec![true, false, false, true, false, false]);
    }
}
