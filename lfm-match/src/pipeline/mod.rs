//! Match pipeline
//!
//! Per-request orchestration of the engine:
//! 1. Validate and normalize the query image (request fails here on bad input)
//! 2. Stream catalog candidates through a bounded pool of evaluations
//! 3. Per candidate: score all branches in parallel, fuse, offer to the ranker
//! 4. Drain the ranker, explain the top entry, assemble `AnalysisResult`
//!
//! Branch failures, explainability failures and cancellation never fail the
//! request; they surface as tagged states on the result.

pub mod orchestrator;

use crate::explain::Explainability;
use crate::fusion::{FusionResult, Signal};
use crate::types::{BranchScore, BranchStatus, CandidateMatch, QueryDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use orchestrator::{MatchPipeline, PipelineConfig};

/// Submitted photograph plus its extracted features
#[derive(Debug, Clone)]
pub struct QueryImage {
    /// Where the upload was received (e.g. the raw upload's object URI)
    pub source_uri: String,
    /// Raw encoded image bytes
    pub bytes: Vec<u8>,
    pub descriptor: QueryDescriptor,
}

/// Everything computed for one candidate
///
/// Carried through the ranker so the top entry can be explained without
/// keeping evaluations for the whole catalog.
#[derive(Debug, Clone)]
pub struct CandidateEvaluation {
    pub object_id: String,
    pub fusion: FusionResult,
    /// All branch scores, degraded ones included
    pub branch_scores: Vec<BranchScore>,
}

impl CandidateEvaluation {
    /// Raw confidences of the branches that succeeded
    pub fn branch_confidences(&self) -> BTreeMap<String, f64> {
        let mut confidences = BTreeMap::new();
        for score in self.branch_scores.iter().filter(|s| s.is_ok()) {
            confidences
                .entry(score.branch.clone())
                .or_insert(score.confidence);
        }
        confidences
    }

    pub fn to_match(&self) -> CandidateMatch {
        CandidateMatch::new(self.object_id.clone(), self.fusion.confidence)
    }
}

/// Whether the whole catalog was evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Complete,
    /// Cancelled or past deadline; built from the candidates ranked so far
    Partial,
}

/// Result of one match request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_id: String,
    /// Unix seconds at request start
    pub timestamp: i64,
    pub normalized_uri: String,
    /// Fusion of the top-ranked candidate; no-signal when the shortlist is empty
    pub fusion_summary: FusionResult,
    /// Top-ranked candidate's raw per-branch confidences
    pub branch_confidences: BTreeMap<String, f64>,
    pub explainability: Explainability,
    /// Best-first, at most K entries
    pub top_k: Vec<CandidateMatch>,
    pub status: ResultStatus,
}

impl AnalysisResult {
    pub fn is_partial(&self) -> bool {
        self.status == ResultStatus::Partial
    }
}

/// Pipeline progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchEvent {
    /// Query accepted, candidate evaluation starting
    RequestStarted {
        request_id: String,
        /// Unix timestamp (seconds since epoch)
        timestamp: i64,
        normalized_uri: String,
    },

    /// A branch timed out or failed for a candidate
    BranchDegraded {
        request_id: String,
        object_id: String,
        branch: String,
        status: BranchStatus,
    },

    /// A candidate was fused and offered to the ranker
    CandidateScored {
        request_id: String,
        object_id: String,
        confidence: f64,
        signal: Signal,
    },

    /// Request finished (fully or partially)
    RequestCompleted {
        request_id: String,
        candidates_evaluated: usize,
        shortlisted: usize,
        status: ResultStatus,
        elapsed_ms: u64,
    },
}
