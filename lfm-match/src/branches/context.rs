//! Context Branch
//!
//! Scores how plausible a match is from report context rather than pixels:
//! - **time decay**: exp(-ln2 × hours / half_life), halving every 72 hours
//!   between the query report and the candidate's last update
//! - **location consistency**: either side without a location 0.70, same
//!   city 0.95, otherwise 0.30 (including a city missing on one side)
//!
//! Blended 0.6 time / 0.4 location.

use crate::types::{BranchError, BranchScorer, CandidateDescriptor, Location, QueryDescriptor};
use async_trait::async_trait;

pub const DEFAULT_HALF_LIFE_HOURS: f64 = 72.0;
pub const TIME_WEIGHT: f64 = 0.6;
pub const LOCATION_WEIGHT: f64 = 0.4;

const SAME_CITY: f64 = 0.95;
const UNKNOWN_LOCATION: f64 = 0.70;
const DIFFERENT_CITY: f64 = 0.30;

/// Exponential decay over the gap between two Unix timestamps
///
/// Gaps are measured in absolute value: a lost report filed after the found
/// report is as plausible as the reverse.
pub fn time_decay_score(ts_a: i64, ts_b: i64, half_life_hours: f64) -> f64 {
    let hours = ts_a.abs_diff(ts_b) as f64 / 3600.0;
    let lambda = std::f64::consts::LN_2 / half_life_hours.max(1e-6);
    (-lambda * hours).exp()
}

/// Rule-based location agreement
///
/// A location with no fields set counts as absent. City names are compared
/// trimmed and ASCII case-insensitively.
pub fn location_consistency_score(a: Option<&Location>, b: Option<&Location>) -> f64 {
    let (Some(a), Some(b)) = (a.filter(|l| !l.is_empty()), b.filter(|l| !l.is_empty())) else {
        return UNKNOWN_LOCATION;
    };

    match (city_of(a), city_of(b)) {
        (Some(x), Some(y)) if x.eq_ignore_ascii_case(y) => SAME_CITY,
        _ => DIFFERENT_CITY,
    }
}

fn city_of(location: &Location) -> Option<&str> {
    location.city.as_deref().map(str::trim).filter(|c| !c.is_empty())
}

/// Report-context branch
#[derive(Debug, Clone)]
pub struct ContextBranch {
    half_life_hours: f64,
}

impl ContextBranch {
    pub fn new() -> Self {
        Self {
            half_life_hours: DEFAULT_HALF_LIFE_HOURS,
        }
    }
}

impl Default for ContextBranch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BranchScorer for ContextBranch {
    fn name(&self) -> &str {
        "context"
    }

    async fn compare(
        &self,
        query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError> {
        let reported = query
            .timestamp
            .ok_or_else(|| BranchError::MissingFeature("query timestamp".to_string()))?;
        let updated = candidate.updated_at.ok_or_else(|| {
            BranchError::MissingFeature(format!("candidate {} updated_at", candidate.object_id))
        })?;

        let time = time_decay_score(reported, updated, self.half_life_hours);
        let location =
            location_consistency_score(query.location.as_ref(), candidate.location.as_ref());

        Ok(TIME_WEIGHT * time + LOCATION_WEIGHT * location)
    }
}
