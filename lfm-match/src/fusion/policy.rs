//! Fusion Policy
//!
//! Nominal per-branch weights. Configured weights need not sum to 1; the
//! aggregator renormalizes over whichever branches succeed.

use crate::error::{MatchError, MatchResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-branch nominal weights
///
/// Weights are finite and nonnegative. Branches absent from the policy have
/// weight 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct FusionPolicy {
    weights: BTreeMap<String, f64>,
}

impl FusionPolicy {
    /// Build a policy, rejecting empty names, negative or non-finite weights,
    /// and weights whose sum overflows
    pub fn new<I, S>(weights: I) -> MatchResult<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (name, weight) in weights {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(MatchError::InvalidInput(
                    "fusion policy branch name is empty".to_string(),
                ));
            }
            if !weight.is_finite() || weight < 0.0 {
                return Err(MatchError::InvalidInput(format!(
                    "fusion weight for '{}' must be finite and nonnegative, got {}",
                    name, weight
                )));
            }
            map.insert(name, weight);
        }
        let total: f64 = map.values().sum();
        if !total.is_finite() {
            return Err(MatchError::InvalidInput(format!(
                "fusion weights must have a finite sum, got {}",
                total
            )));
        }
        Ok(Self { weights: map })
    }

    /// Weight for `branch`, 0 if unknown
    pub fn weight(&self, branch: &str) -> f64 {
        self.weights.get(branch).copied().unwrap_or(0.0)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.weights.contains_key(branch)
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl TryFrom<BTreeMap<String, f64>> for FusionPolicy {
    type Error = MatchError;

    fn try_from(weights: BTreeMap<String, f64>) -> MatchResult<Self> {
        Self::new(weights)
    }
}

impl From<FusionPolicy> for BTreeMap<String, f64> {
    fn from(policy: FusionPolicy) -> Self {
        policy.weights
    }
}
