//! Branch Scorers
//!
//! Independent similarity signals, each implementing `BranchScorer`, plus the
//! executor that fans one (query, candidate) pair out to all of them.
//!
//! # Built-in branches
//! 1. **embedding** - cosine similarity of a named feature embedding
//! 2. **context** - report-time decay and location consistency
//! 3. **history** - per-object confidence learned from match feedback
//!
//! Model-backed branches (CLIP/ViT, segmentation, inpainting) live outside
//! this crate and plug in through the same trait.
//!
//! # Parallel Execution
//! All branches run concurrently for a candidate, each bounded by its own
//! timeout. A failed or slow branch never blocks or fails the others.

pub mod context;
pub mod embedding;
pub mod history;

pub use context::ContextBranch;
pub use embedding::EmbeddingBranch;
pub use history::{HistoryBranch, ObjectHistory};

use crate::types::{BranchScore, BranchScorer, CandidateDescriptor, QueryDescriptor};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Parallel branch executor
///
/// Holds the branch set registered at startup. Scores are returned in
/// registration order, one per branch, including degraded ones.
///
/// # Example
/// ```rust,ignore
/// let scorers: Vec<Arc<dyn BranchScorer>> = vec![
///     Arc::new(EmbeddingBranch::new("semantic", "semantic")),
///     Arc::new(ContextBranch::new()),
/// ];
///
/// let executor = ParallelScorer::new(scorers, Duration::from_secs(2));
/// let scores = executor.score_all(&query, &candidate).await;
/// ```
#[derive(Clone)]
pub struct ParallelScorer {
    scorers: Vec<Arc<dyn BranchScorer>>,
    timeout: Duration,
}

impl ParallelScorer {
    pub fn new(scorers: Vec<Arc<dyn BranchScorer>>, timeout: Duration) -> Self {
        Self { scorers, timeout }
    }

    /// Score one pair on every branch concurrently
    pub async fn score_all(
        &self,
        query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Vec<BranchScore> {
        let futures = self
            .scorers
            .iter()
            .map(|scorer| scorer.score(query, candidate, self.timeout));

        let scores = join_all(futures).await;

        debug!(
            object_id = %candidate.object_id,
            succeeded = scores.iter().filter(|s| s.is_ok()).count(),
            total = scores.len(),
            "Branch scoring complete"
        );

        scores
    }

    /// Registered branch names, in registration order
    pub fn branch_names(&self) -> Vec<String> {
        self.scorers.iter().map(|s| s.name().to_string()).collect()
    }
}

// ============================================================================
// Mock Branches for Testing
// ============================================================================
