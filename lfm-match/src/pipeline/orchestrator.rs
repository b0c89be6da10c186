//! Pipeline Orchestrator
//!
//! Runs one match request end to end.
//!
//! # Concurrency
//! - Candidates: up to `candidate_concurrency` evaluations in flight via
//!   `buffer_unordered`; the catalog stream is only polled when a slot frees up
//! - Branches: all branches of one candidate run concurrently, each under
//!   `branch_timeout`
//! - Shared state: only the ranker, behind its own mutex
//!
//! # Cancellation
//! The cancellation token and the overall deadline race the evaluation
//! stream. When either fires, the stream is dropped (cancelling in-flight
//! branch calls), the catalog is abandoned, and the result is assembled from
//! what the ranker holds, marked `Partial`.
//!
//! # Example
//! ```rust,ignore
//! let pipeline = MatchPipeline::new(config, scorers)?
//!     .with_store(Arc::new(LocalImageStore::new("/var/lib/lfm")));
//! let result = pipeline
//!     .run(query, futures::stream::iter(catalog), CancellationToken::new())
//!     .await?;
//! ```

use super::{AnalysisResult, CandidateEvaluation, MatchEvent, QueryImage, ResultStatus};
use crate::branches::ParallelScorer;
use crate::error::{MatchError, MatchResult};
use crate::explain::ExplainabilityPackager;
use crate::fusion::{FusionAggregator, FusionPolicy, FusionResult};
use crate::preprocess::{self, NormalizedImage};
use crate::ranking::{CandidateRanker, DEFAULT_TOP_K};
use crate::storage::ImageStore;
use crate::types::{BranchScorer, CandidateDescriptor, QueryDescriptor};
use futures::stream::{Stream, StreamExt};
use lfm_common::sanitize::sanitize_for_logs;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Level};
use uuid::Uuid;

pub const DEFAULT_BRANCH_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CANDIDATE_CONCURRENCY: usize = 4;
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Nominal branch weights
    pub policy: FusionPolicy,
    /// Shortlist length K
    pub top_k: usize,
    /// Per-branch, per-candidate timeout
    pub branch_timeout: Duration,
    /// Maximum candidate evaluations in flight
    pub candidate_concurrency: usize,
    /// Overall request deadline; `None` waits for the whole catalog
    pub request_deadline: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            policy: FusionPolicy::default(),
            top_k: DEFAULT_TOP_K,
            branch_timeout: DEFAULT_BRANCH_TIMEOUT,
            candidate_concurrency: DEFAULT_CANDIDATE_CONCURRENCY,
            request_deadline: Some(DEFAULT_REQUEST_DEADLINE),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> MatchResult<()> {
        if self.candidate_concurrency == 0 {
            return Err(MatchError::Config(
                "candidate_concurrency must be at least 1".to_string(),
            ));
        }
        if self.branch_timeout.is_zero() {
            return Err(MatchError::Config(
                "branch_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Match pipeline orchestrator
pub struct MatchPipeline {
    config: PipelineConfig,
    scorers: ParallelScorer,
    aggregator: FusionAggregator,
    explainer: ExplainabilityPackager,
    store: Option<Arc<dyn ImageStore>>,
    event_tx: Option<mpsc::Sender<MatchEvent>>,
}

impl MatchPipeline {
    /// Create a pipeline over the branch set registered at startup
    ///
    /// Branch names must be unique and non-empty. Registered branches missing
    /// from the policy are allowed (they weigh 0) but logged.
    pub fn new(config: PipelineConfig, scorers: Vec<Arc<dyn BranchScorer>>) -> MatchResult<Self> {
        config.validate()?;

        if scorers.is_empty() {
            return Err(MatchError::Config("no branch scorers registered".to_string()));
        }

        let mut names = BTreeSet::new();
        for scorer in &scorers {
            let name = scorer.name();
            if name.trim().is_empty() {
                return Err(MatchError::Config("branch scorer with empty name".to_string()));
            }
            if !names.insert(name.to_string()) {
                return Err(MatchError::Config(format!(
                    "branch '{}' registered twice",
                    name
                )));
            }
            if !config.policy.contains(name) {
                warn!(branch = name, "Branch has no fusion weight, it will only count under equal weighting");
            }
        }

        info!(
            branches = ?names,
            top_k = config.top_k,
            branch_timeout_ms = config.branch_timeout.as_millis() as u64,
            candidate_concurrency = config.candidate_concurrency,
            "Match pipeline configured"
        );

        let scorers = ParallelScorer::new(scorers, config.branch_timeout);
        Ok(Self {
            config,
            scorers,
            aggregator: FusionAggregator::new(),
            explainer: ExplainabilityPackager::new(),
            store: None,
            event_tx: None,
        })
    }

    /// Attach an event channel for progress reporting
    pub fn with_events(mut self, event_tx: mpsc::Sender<MatchEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Store normalized query images; without a store the source URI is reported
    pub fn with_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_explainer(mut self, explainer: ExplainabilityPackager) -> Self {
        self.explainer = explainer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one match request
    ///
    /// # Errors
    /// - `InvalidInput`: blank source URI, malformed descriptor or image
    /// - `CapacityExhausted`: the blocking pool could not normalize the image
    ///
    /// Everything else yields an `AnalysisResult`.
    pub async fn run<S>(
        &self,
        query: QueryImage,
        catalog: S,
        cancel: CancellationToken,
    ) -> MatchResult<AnalysisResult>
    where
        S: Stream<Item = CandidateDescriptor>,
    {
        let request_id = Uuid::new_v4().to_string();
        let timestamp = lfm_common::time::unix_now();
        let started = tokio::time::Instant::now();

        info!(request_id = %request_id, source_uri = %query.source_uri, "Match request started");

        let QueryImage {
            source_uri,
            bytes,
            descriptor,
        } = query;

        if source_uri.trim().is_empty() {
            return Err(MatchError::InvalidInput("query source URI is empty".to_string()));
        }
        descriptor.validate().map_err(MatchError::InvalidInput)?;
        let normalized = preprocess::normalize_image_blocking(bytes).await?;
        let normalized_uri = self
            .store_normalized(&request_id, &normalized, &source_uri)
            .await;

        self.emit_event(MatchEvent::RequestStarted {
            request_id: request_id.clone(),
            timestamp,
            normalized_uri: normalized_uri.clone(),
        });

        let ranker = CandidateRanker::new(self.config.top_k);
        let evaluated = AtomicUsize::new(0);

        let status = self
            .evaluate_catalog(&request_id, &descriptor, catalog, &ranker, &evaluated, &cancel)
            .await;

        let ranked = ranker.drain();
        let top = ranked.first().map(|r| &r.detail);

        let explainability = self
            .explainer
            .explain(&request_id, &normalized_uri, top)
            .await;

        let result = AnalysisResult {
            request_id: request_id.clone(),
            timestamp,
            normalized_uri,
            fusion_summary: top
                .map(|t| t.fusion.clone())
                .unwrap_or_else(FusionResult::no_signal),
            branch_confidences: top.map(|t| t.branch_confidences()).unwrap_or_default(),
            explainability,
            top_k: ranked.iter().map(|r| r.candidate.clone()).collect(),
            status,
        };

        let candidates_evaluated = evaluated.load(Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            request_id = %request_id,
            candidates_evaluated,
            shortlisted = result.top_k.len(),
            top_confidence = result.fusion_summary.confidence,
            status = ?status,
            elapsed_ms,
            "Match request complete"
        );

        self.emit_event(MatchEvent::RequestCompleted {
            request_id,
            candidates_evaluated,
            shortlisted: result.top_k.len(),
            status,
            elapsed_ms,
        });

        Ok(result)
    }

    /// Drive candidate evaluations until the catalog ends, the request is
    /// cancelled or the deadline passes
    async fn evaluate_catalog<S>(
        &self,
        request_id: &str,
        query: &QueryDescriptor,
        catalog: S,
        ranker: &CandidateRanker<CandidateEvaluation>,
        evaluated: &AtomicUsize,
        cancel: &CancellationToken,
    ) -> ResultStatus
    where
        S: Stream<Item = CandidateDescriptor>,
    {
        let evaluations = catalog
            .map(|candidate| self.evaluate_candidate(request_id, query, candidate, ranker, evaluated))
            .buffer_unordered(self.config.candidate_concurrency);
        tokio::pin!(evaluations);

        let deadline = self.config.request_deadline;
        let deadline_elapsed = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_elapsed);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!(
                        request_id,
                        evaluated = evaluated.load(Ordering::Relaxed),
                        "Request cancelled, returning partial result"
                    );
                    return ResultStatus::Partial;
                }
                _ = &mut deadline_elapsed => {
                    warn!(
                        request_id,
                        evaluated = evaluated.load(Ordering::Relaxed),
                        "Request deadline exceeded, returning partial result"
                    );
                    return ResultStatus::Partial;
                }
                next = evaluations.next() => {
                    if next.is_none() {
                        return ResultStatus::Complete;
                    }
                }
            }
        }
    }

    /// Score, fuse and rank one candidate
    async fn evaluate_candidate(
        &self,
        request_id: &str,
        query: &QueryDescriptor,
        candidate: CandidateDescriptor,
        ranker: &CandidateRanker<CandidateEvaluation>,
        evaluated: &AtomicUsize,
    ) {
        if candidate.object_id.trim().is_empty() {
            warn!(request_id, "Skipping catalog entry without object_id");
            return;
        }

        if tracing::enabled!(Level::TRACE) {
            let logged = serde_json::to_value(&candidate).unwrap_or_default();
            trace!(request_id, candidate = %sanitize_for_logs(&logged), "Evaluating candidate");
        }

        let scores = self.scorers.score_all(query, &candidate).await;

        for degraded in scores.iter().filter(|s| !s.is_ok()) {
            self.emit_event(MatchEvent::BranchDegraded {
                request_id: request_id.to_string(),
                object_id: candidate.object_id.clone(),
                branch: degraded.branch.clone(),
                status: degraded.status,
            });
        }

        let fusion = self.aggregator.fuse(&scores, &self.config.policy);

        debug!(
            request_id,
            object_id = %candidate.object_id,
            confidence = fusion.confidence,
            signal = ?fusion.signal,
            "Candidate fused"
        );

        let (confidence, signal) = (fusion.confidence, fusion.signal);
        let evaluation = CandidateEvaluation {
            object_id: candidate.object_id,
            fusion,
            branch_scores: scores,
        };
        let scored = evaluation.to_match();
        ranker.offer(scored.clone(), evaluation);
        evaluated.fetch_add(1, Ordering::Relaxed);

        self.emit_event(MatchEvent::CandidateScored {
            request_id: request_id.to_string(),
            object_id: scored.object_id,
            confidence,
            signal,
        });
    }

    /// Store the normalized image, falling back to the source URI on failure
    async fn store_normalized(
        &self,
        request_id: &str,
        normalized: &NormalizedImage,
        source_uri: &str,
    ) -> String {
        let Some(store) = &self.store else {
            return source_uri.to_string();
        };

        let object_path = format!("normalized/{}.jpg", request_id);
        match store.put(&object_path, &normalized.bytes, "image/jpeg").await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(
                    request_id,
                    error = %e,
                    "Storing normalized image failed (non-fatal), reporting source URI"
                );
                source_uri.to_string()
            }
        }
    }

    /// Emit event if channel configured
    ///
    /// Never waits on the observer: a full channel drops the event.
    fn emit_event(&self, event: MatchEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
                debug!(event = ?event, "Event channel full, dropping progress event");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
