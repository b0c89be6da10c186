//! Explainability Packager
//!
//! Turns the top candidate's fusion into a one-sentence rationale and, when a
//! renderer is configured, a saliency heatmap stored alongside the request.
//!
//! The rationale names the dominant contributor: the branch with the largest
//! applied weight × confidence (ties go to the lexicographically first
//! branch). Heatmap rendering is best-effort; a failing or slow renderer only
//! drops `heatmap_object_path`.

use crate::fusion::Signal;
use crate::pipeline::CandidateEvaluation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_HEATMAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Heatmap renderer error
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Render failed: {0}")]
    Failed(String),

    #[error("Store error: {0}")]
    Store(#[from] crate::storage::StoreError),
}

/// External saliency renderer (Grad-CAM overlay or similar)
#[async_trait]
pub trait HeatmapRenderer: Send + Sync {
    /// Render and store a heatmap for `request_id`, returning its object path
    async fn render(
        &self,
        request_id: &str,
        normalized_uri: &str,
        object_id: &str,
    ) -> Result<String, RenderError>;
}

/// Explainability artifact attached to every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explainability {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap_object_path: Option<String>,
}

/// Explainability packager
#[derive(Clone)]
pub struct ExplainabilityPackager {
    renderer: Option<Arc<dyn HeatmapRenderer>>,
    timeout: Duration,
}

impl ExplainabilityPackager {
    /// Summary-only packager
    pub fn new() -> Self {
        Self {
            renderer: None,
            timeout: DEFAULT_HEATMAP_TIMEOUT,
        }
    }

    pub fn with_renderer(renderer: Arc<dyn HeatmapRenderer>, timeout: Duration) -> Self {
        Self {
            renderer: Some(renderer),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_renderer(&self) -> bool {
        self.renderer.is_some()
    }

    /// Explain the top-ranked candidate (`None` when the shortlist is empty)
    pub async fn explain(
        &self,
        request_id: &str,
        normalized_uri: &str,
        top: Option<&CandidateEvaluation>,
    ) -> Explainability {
        let summary = summarize(top);

        let heatmap_object_path = match (top, &self.renderer) {
            (Some(top), Some(renderer)) if top.fusion.signal == Signal::Fused => {
                self.render_heatmap(renderer.as_ref(), request_id, normalized_uri, &top.object_id)
                    .await
            }
            _ => None,
        };

        Explainability {
            summary,
            heatmap_object_path,
        }
    }

    async fn render_heatmap(
        &self,
        renderer: &dyn HeatmapRenderer,
        request_id: &str,
        normalized_uri: &str,
        object_id: &str,
    ) -> Option<String> {
        let attempt = renderer.render(request_id, normalized_uri, object_id);
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(path)) => {
                debug!(request_id, path = %path, "Heatmap rendered");
                Some(path)
            }
            Ok(Err(e)) => {
                warn!(request_id, error = %e, "Heatmap rendering failed (non-fatal)");
                None
            }
            Err(_) => {
                warn!(
                    request_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Heatmap rendering timed out (non-fatal)"
                );
                None
            }
        }
    }
}

impl Default for ExplainabilityPackager {
    fn default() -> Self {
        Self::new()
    }
}

/// Branch with the largest weight × confidence, with its confidence and weight
pub fn dominant_contributor(top: &CandidateEvaluation) -> Option<(&str, f64, f64)> {
    let confidences = top.branch_confidences();
    let mut best: Option<(&str, f64, f64, f64)> = None;

    for (branch, weight) in &top.fusion.applied_weights {
        let confidence = confidences.get(branch).copied().unwrap_or(0.0);
        let contribution = weight * confidence;
        let better = match best {
            Some((_, _, _, best_contribution)) => contribution > best_contribution,
            None => true,
        };
        if better {
            best = Some((branch.as_str(), confidence, *weight, contribution));
        }
    }

    best.map(|(branch, confidence, weight, _)| (branch, confidence, weight))
}

fn summarize(top: Option<&CandidateEvaluation>) -> String {
    let Some(top) = top else {
        return "No candidates were available for comparison.".to_string();
    };

    if top.fusion.signal == Signal::NoSignal {
        return format!(
            "No branch produced a usable signal for candidate {}; its score of 0 is not a similarity measurement.",
            top.object_id
        );
    }

    let mut summary = match dominant_contributor(top) {
        Some((branch, confidence, weight)) => format!(
            "Candidate {} matched with {:.1}% overall confidence; the strongest evidence came from '{}' ({:.1}% confidence at {:.1}% weight).",
            top.object_id,
            top.fusion.confidence * 100.0,
            branch,
            confidence * 100.0,
            weight * 100.0
        ),
        None => format!(
            "Candidate {} matched with {:.1}% overall confidence.",
            top.object_id,
            top.fusion.confidence * 100.0
        ),
    };

    let excluded = top.branch_scores.iter().filter(|s| !s.is_ok()).count();
    if excluded > 0 {
        summary.push_str(&format!(
            " {} of {} branches were unavailable.",
            excluded,
            top.branch_scores.len()
        ));
    }

    summary
}

// ============================================================================
// Tests
// ============================================================================
