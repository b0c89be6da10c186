//! Fusion Aggregator
//!
//! Combines per-branch confidences for one candidate into a single score.
//!
//! # Algorithm (linear opinion pool)
//! 1. Keep branches with status `Ok`; timed-out and failed branches are excluded
//! 2. No successful branch → no-signal result (confidence 0, no weights)
//! 3. Look up each successful branch's nominal weight (unknown → 0)
//! 4. If the weights sum to 0, weight the successful branches equally
//! 5. Renormalize: applied(b) = weight(b) / Σ weight
//! 6. confidence = Σ applied(b) × confidence(b), clamped to [0, 1]
//!
//! A weighted arithmetic mean tolerates a single branch reporting 0 without
//! collapsing the whole fusion to 0, unlike a geometric pool.
//!
//! # Example Calculation
//! Weights {vision: 0.5, embedding: 0.3, metadata: 0.2}, metadata timed out:
//!
//! applied = {vision: 0.5/0.8 = 0.625, embedding: 0.3/0.8 = 0.375}
//! confidence = 0.625 × 0.8 + 0.375 × 0.6 = 0.725

use super::{FusionPolicy, FusionResult, Signal};
use crate::types::{clamp_unit, BranchScore};
use std::collections::BTreeMap;
use tracing::debug;

/// Fusion aggregator
///
/// Stateless; iteration runs in branch-name order so identical input yields
/// bit-identical output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionAggregator;

impl FusionAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Fuse one candidate's branch scores under `policy`
    ///
    /// When a branch name appears more than once, its first occurrence wins.
    pub fn fuse(&self, scores: &[BranchScore], policy: &FusionPolicy) -> FusionResult {
        let mut seen: BTreeMap<&str, Option<f64>> = BTreeMap::new();
        for score in scores {
            seen.entry(score.branch.as_str())
                .or_insert_with(|| score.is_ok().then_some(score.confidence));
        }

        let successful: BTreeMap<&str, f64> = seen
            .into_iter()
            .filter_map(|(branch, confidence)| confidence.map(|c| (branch, c)))
            .collect();

        if successful.is_empty() {
            debug!(input_count = scores.len(), "No successful branches, no signal");
            return FusionResult::no_signal();
        }

        let total: f64 = successful.keys().map(|b| policy.weight(b)).sum();

        let applied_weights: BTreeMap<String, f64> = if total > 0.0 {
            successful
                .keys()
                .filter_map(|b| {
                    let weight = policy.weight(b);
                    (weight > 0.0).then(|| (b.to_string(), weight / total))
                })
                .collect()
        } else {
            let equal = 1.0 / successful.len() as f64;
            successful.keys().map(|b| (b.to_string(), equal)).collect()
        };

        let confidence: f64 = applied_weights
            .iter()
            .map(|(branch, weight)| weight * successful[branch.as_str()])
            .sum();

        debug!(
            successful = successful.len(),
            excluded = scores.len() - successful.len(),
            equal_weighting = total <= 0.0,
            confidence,
            "Fused branch scores"
        );

        FusionResult {
            confidence: clamp_unit(confidence),
            applied_weights,
            signal: Signal::Fused,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
