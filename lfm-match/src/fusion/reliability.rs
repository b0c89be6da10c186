//! Branch Reliability
//!
//! Tracks how often each branch agreed with user-confirmed matches as Beta
//! counts (α = confirmed, β = rejected, both starting at 5). The effective
//! fusion weight of a branch is its nominal weight scaled by the reliability
//! mean α / (α + β), so consistently wrong branches lose influence.
//!
//! Persisted as a TOML table keyed by branch name:
//! ```toml
//! [branches.vision]
//! alpha = 8.0
//! beta = 2.0
//! ```

use super::FusionPolicy;
use crate::error::MatchResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Prior pseudo-counts for a branch with no feedback yet
pub const PRIOR_ALPHA: f64 = 5.0;
pub const PRIOR_BETA: f64 = 5.0;

/// Beta distribution counts for one branch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaCounts {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for BetaCounts {
    fn default() -> Self {
        Self {
            alpha: PRIOR_ALPHA,
            beta: PRIOR_BETA,
        }
    }
}

impl BetaCounts {
    /// Reliability mean α / (α + β); 0.5 for degenerate counts
    pub fn mean(&self) -> f64 {
        let total = self.alpha + self.beta;
        if total > 0.0 && total.is_finite() {
            self.alpha / total
        } else {
            0.5
        }
    }
}

/// Per-branch reliability counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityTable {
    #[serde(default)]
    branches: BTreeMap<String, BetaCounts>,
}

impl ReliabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from TOML; a missing file yields the empty (all-prior) table
    pub fn load(path: &Path) -> MatchResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No reliability file, using priors");
            return Ok(Self::default());
        }
        Ok(lfm_common::config::load_toml_config(path)?)
    }

    pub fn save(&self, path: &Path) -> MatchResult<()> {
        lfm_common::config::write_toml_config(self, path)?;
        Ok(())
    }

    /// Counts for `branch`, the prior if never seen
    pub fn get(&self, branch: &str) -> BetaCounts {
        self.branches.get(branch).copied().unwrap_or_default()
    }

    /// Record whether the branches used for a match were right
    pub fn record_feedback<S: AsRef<str>>(&mut self, branches: &[S], was_correct: bool) {
        for branch in branches {
            let counts = self
                .branches
                .entry(branch.as_ref().to_string())
                .or_default();
            if was_correct {
                counts.alpha += 1.0;
            } else {
                counts.beta += 1.0;
            }
            info!(
                branch = branch.as_ref(),
                was_correct,
                alpha = counts.alpha,
                beta = counts.beta,
                "Updated branch reliability"
            );
        }
    }

    /// Scale each nominal weight by the branch's reliability mean
    pub fn effective_policy(&self, base: &FusionPolicy) -> MatchResult<FusionPolicy> {
        FusionPolicy::new(
            base.weights()
                .iter()
                .map(|(branch, weight)| (branch.clone(), weight * self.get(branch).mean())),
        )
    }
}
