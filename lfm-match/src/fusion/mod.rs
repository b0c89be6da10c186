//! Fusion Module
//!
//! Reduces per-branch confidences for one candidate to a single score.
//!
//! - **policy** - per-branch nominal weights
//! - **aggregator** - linear opinion pool with missing-branch renormalization
//! - **reliability** - feedback-driven per-branch reliability that scales the
//!   nominal weights

pub mod aggregator;
pub mod policy;
pub mod reliability;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use aggregator::FusionAggregator;
pub use policy::FusionPolicy;
pub use reliability::{BetaCounts, ReliabilityTable};

/// Tolerance for "applied weights sum to 1"
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Whether a fusion had any signal to work with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// At least one branch succeeded
    Fused,
    /// Every branch failed or timed out; confidence 0 is not a measurement
    NoSignal,
}

/// Fused confidence for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    /// Overall confidence in [0, 1]
    pub confidence: f64,
    /// Weights actually applied, successful branches only; sums to 1 unless empty
    #[serde(rename = "branch_weights")]
    pub applied_weights: BTreeMap<String, f64>,
    pub signal: Signal,
}

impl FusionResult {
    /// The no-signal state: no branch succeeded
    pub fn no_signal() -> Self {
        Self {
            confidence: 0.0,
            applied_weights: BTreeMap::new(),
            signal: Signal::NoSignal,
        }
    }

    pub fn is_no_signal(&self) -> bool {
        self.signal == Signal::NoSignal
    }
}
