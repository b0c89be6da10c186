//! Error types for lfm-match
//!
//! Only request-level failures are errors. Branch failures, missing
//! explainability and cancellation are absorbed and reported as tagged
//! states on the result (`BranchStatus`, `Signal`, `ResultStatus`).

use thiserror::Error;

/// Request-level failure
#[derive(Debug, Error)]
pub enum MatchError {
    /// Malformed query image, descriptor or fusion policy
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unusable pipeline configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No evaluation capacity left to run the request
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// lfm-common error
    #[error("Common error: {0}")]
    Common(#[from] lfm_common::Error),
}

/// Result type for match operations
pub type MatchResult<T> = Result<T, MatchError>;
