//! Object History Branch
//!
//! Per-object confidence learned from user feedback. A confirmed match raises
//! the object's confidence by 0.05 and a rejected one lowers it by 0.08,
//! bounded to [0, 1]. Objects with no feedback score 0.5.
//!
//! Persisted as a TOML table keyed by object id:
//! ```toml
//! [objects]
//! obj-17 = 0.55
//! ```

use crate::error::{MatchError, MatchResult};
use crate::types::{BranchError, BranchScorer, CandidateDescriptor, QueryDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Confidence of an object nobody has given feedback on
pub const DEFAULT_OBJECT_CONFIDENCE: f64 = 0.5;

/// Increase per confirmed match
pub const CONFIRMED_STEP: f64 = 0.05;

/// Decrease per rejected match
pub const REJECTED_STEP: f64 = 0.08;

/// Per-object feedback confidence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectHistory {
    #[serde(default)]
    objects: BTreeMap<String, f64>,
}

impl ObjectHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from TOML; a missing file yields the empty table
    pub fn load(path: &Path) -> MatchResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No object history file, using defaults");
            return Ok(Self::default());
        }
        let history: Self = lfm_common::config::load_toml_config(path)?;
        if let Some((object_id, confidence)) = history
            .objects
            .iter()
            .find(|(_, c)| !(0.0..=1.0).contains(*c))
        {
            return Err(MatchError::Config(format!(
                "object history {}: confidence {} for '{}' is outside [0, 1]",
                path.display(),
                confidence,
                object_id
            )));
        }
        Ok(history)
    }

    pub fn save(&self, path: &Path) -> MatchResult<()> {
        lfm_common::config::write_toml_config(self, path)?;
        Ok(())
    }

    /// Confidence for `object_id`, the default if never seen
    pub fn confidence(&self, object_id: &str) -> f64 {
        self.objects
            .get(object_id)
            .copied()
            .unwrap_or(DEFAULT_OBJECT_CONFIDENCE)
    }

    /// Record whether a match against `object_id` was right, returning the
    /// updated confidence
    pub fn record_feedback(&mut self, object_id: &str, was_correct: bool) -> f64 {
        let previous = self.confidence(object_id);
        let updated = if was_correct {
            (previous + CONFIRMED_STEP).min(1.0)
        } else {
            (previous - REJECTED_STEP).max(0.0)
        };
        self.objects.insert(object_id.to_string(), updated);

        info!(
            object_id,
            was_correct,
            previous,
            confidence = updated,
            "Updated object confidence"
        );
        updated
    }
}

/// Branch scoring a candidate by its feedback history
///
/// Reads a snapshot taken at startup; feedback recorded later applies to the
/// next process.
#[derive(Debug, Clone)]
pub struct HistoryBranch {
    history: Arc<ObjectHistory>,
}

impl HistoryBranch {
    pub fn new(history: ObjectHistory) -> Self {
        Self {
            history: Arc::new(history),
        }
    }
}

#[async_trait]
impl BranchScorer for HistoryBranch {
    fn name(&self) -> &str {
        "history"
    }

    async fn compare(
        &self,
        _query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError> {
        Ok(self.history.confidence(&candidate.object_id))
    }
}
