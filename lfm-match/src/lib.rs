//! # Lost & Found Match Engine
//!
//! Compares a submitted photograph against a catalog of previously reported
//! items and returns a ranked shortlist with a fused confidence and a
//! human-readable rationale.
//!
//! ## Architecture
//! - **Branches** (`branches`): independent similarity signals behind the
//!   `BranchScorer` trait, run concurrently per candidate with a timeout each
//! - **Fusion** (`fusion`): renormalized weighted pool over the branches that
//!   succeeded, plus reliability feedback on the nominal weights
//! - **Ranking** (`ranking`): concurrent bounded top-K
//! - **Explainability** (`explain`, `heatmap`): rationale and optional
//!   saliency overlay
//! - **Pipeline** (`pipeline`): per-request orchestration, cancellation and
//!   progress events

pub mod branches;
pub mod config;
pub mod error;
pub mod explain;
pub mod fusion;
pub mod heatmap;
pub mod pipeline;
pub mod preprocess;
pub mod ranking;
pub mod storage;
pub mod types;

pub use config::MatchConfig;
pub use error::{MatchError, MatchResult};
pub use fusion::{FusionAggregator, FusionPolicy, FusionResult, ReliabilityTable, Signal};
pub use pipeline::{AnalysisResult, MatchEvent, MatchPipeline, PipelineConfig, QueryImage, ResultStatus};
pub use ranking::CandidateRanker;
pub use types::{
    BranchError, BranchScore, BranchScorer, BranchStatus, CandidateDescriptor, CandidateMatch,
    QueryDescriptor,
};
