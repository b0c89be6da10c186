//! Core Types and Trait Definitions for LFM-Match
//!
//! Defines the branch scoring contract and the values that flow through the
//! match pipeline:
//! - **Descriptors:** query and candidate feature bundles (opaque to the engine,
//!   interpreted only by branch scorers)
//! - **BranchScorer:** one independent similarity signal
//! - **BranchScore:** one branch's verdict for one (query, candidate) pair
//! - **CandidateMatch:** ranked shortlist entry with a deterministic total order

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Clamp a confidence to [0, 1], mapping non-finite values to 0
///
/// Adding 0.0 folds negative zero into positive zero so that the value
/// compares equal under `f64::total_cmp`.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0) + 0.0
    } else {
        0.0
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Where an item was lost or found
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

impl Location {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.lat.is_none() && self.lng.is_none()
    }
}

/// Features extracted from the submitted photograph
///
/// Produced by the (external) feature extractors. Each embedding is keyed by
/// the extractor that produced it, e.g. `"semantic"` or `"negative_space"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
    /// Unix seconds when the item was reported
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub location: Option<Location>,
}

impl QueryDescriptor {
    /// Reject descriptors no branch could meaningfully compare against
    pub fn validate(&self) -> Result<(), String> {
        for (key, vector) in &self.embeddings {
            if key.trim().is_empty() {
                return Err("embedding with empty name".to_string());
            }
            if vector.is_empty() {
                return Err(format!("embedding '{}' is empty", key));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(format!("embedding '{}' contains non-finite values", key));
            }
        }
        Ok(())
    }
}

/// A previously reported item of the opposite status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// Catalog-assigned identifier, unique within the catalog
    pub object_id: String,
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
    /// Unix seconds of the last update to this catalog entry
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub location: Option<Location>,
}

// ============================================================================
// Branch Scoring
// ============================================================================

/// Outcome of one branch invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Ok,
    TimedOut,
    Failed,
}

/// One branch's confidence for one (query, candidate) pair
///
/// `confidence` is meaningful only when `status` is `Ok`; degraded scores
/// carry 0.0 and are excluded from fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchScore {
    pub branch: String,
    pub confidence: f64,
    pub status: BranchStatus,
}

impl BranchScore {
    /// Successful score with clamped confidence
    pub fn ok(branch: impl Into<String>, confidence: f64) -> Self {
        Self {
            branch: branch.into(),
            confidence: clamp_unit(confidence),
            status: BranchStatus::Ok,
        }
    }

    pub fn timed_out(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            confidence: 0.0,
            status: BranchStatus::TimedOut,
        }
    }

    pub fn failed(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            confidence: 0.0,
            status: BranchStatus::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == BranchStatus::Ok
    }
}

/// Branch comparison error
///
/// Never leaves the branch: `BranchScorer::score` converts it to
/// `BranchStatus::Failed`.
#[derive(Debug, Error)]
pub enum BranchError {
    /// Query or candidate lacks the feature this branch compares
    #[error("Missing feature: {0}")]
    MissingFeature(String),

    /// Feature vectors have different lengths
    #[error("Dimension mismatch: query {query}, candidate {candidate}")]
    DimensionMismatch { query: usize, candidate: usize },

    /// Backing model or service error
    #[error("Service error: {0}")]
    Service(String),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Independent visual-similarity signal
///
/// Implementations provide `compare`; callers use `score`, which applies the
/// per-branch timeout and folds every failure mode into `BranchScore::status`.
/// Implementations must not share mutable state across calls: the pipeline
/// invokes the same scorer concurrently for different candidates.
///
/// # Example
/// ```rust,ignore
/// use lfm_match::types::{BranchScorer, BranchError, QueryDescriptor, CandidateDescriptor};
///
/// pub struct ColorHistogramBranch;
///
/// #[async_trait::async_trait]
/// impl BranchScorer for ColorHistogramBranch {
///     fn name(&self) -> &str { "color_histogram" }
///
///     async fn compare(
///         &self,
///         query: &QueryDescriptor,
///         candidate: &CandidateDescriptor,
///     ) -> Result<f64, BranchError> {
///         histogram_intersection(query, candidate)
///     }
/// }
/// ```
#[async_trait]
pub trait BranchScorer: Send + Sync {
    /// Branch name, used as the key into `FusionPolicy` weights
    fn name(&self) -> &str;

    /// Compute raw similarity in [0, 1] for one pair
    async fn compare(
        &self,
        query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError>;

    /// Score one pair under `timeout`; never fails
    ///
    /// - timeout elapsed → `TimedOut`
    /// - `compare` error, panic or non-finite value → `Failed`
    /// - otherwise `Ok` with the confidence clamped to [0, 1]
    async fn score(
        &self,
        query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
        timeout: Duration,
    ) -> BranchScore {
        let name = self.name();
        let attempt = AssertUnwindSafe(self.compare(query, candidate)).catch_unwind();

        match tokio::time::timeout(timeout, attempt).await {
            Err(_) => {
                debug!(
                    branch = name,
                    object_id = %candidate.object_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Branch timed out"
                );
                BranchScore::timed_out(name)
            }
            Ok(Err(_)) => {
                warn!(
                    branch = name,
                    object_id = %candidate.object_id,
                    "Branch panicked"
                );
                BranchScore::failed(name)
            }
            Ok(Ok(Err(e))) => {
                debug!(
                    branch = name,
                    object_id = %candidate.object_id,
                    error = %e,
                    "Branch failed"
                );
                BranchScore::failed(name)
            }
            Ok(Ok(Ok(confidence))) if confidence.is_finite() => BranchScore::ok(name, confidence),
            Ok(Ok(Ok(confidence))) => {
                warn!(
                    branch = name,
                    object_id = %candidate.object_id,
                    confidence,
                    "Branch returned non-finite confidence"
                );
                BranchScore::failed(name)
            }
        }
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// Shortlist entry
///
/// Ordering is the ranking order: `a < b` means `a` ranks ahead of `b`
/// (higher score first, then lexicographically smaller `object_id`). Sorting
/// ascending therefore yields best-first, and the order is total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateMatch {
    pub object_id: String,
    pub score: f64,
}

impl CandidateMatch {
    pub fn new(object_id: impl Into<String>, score: f64) -> Self {
        Self {
            object_id: object_id.into(),
            score: clamp_unit(score),
        }
    }
}

impl Ord for CandidateMatch {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.object_id.cmp(&other.object_id))
    }
}

impl PartialOrd for CandidateMatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CandidateMatch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CandidateMatch {}

// ============================================================================
// Tests
// ============================================================================
