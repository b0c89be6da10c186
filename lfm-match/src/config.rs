//! Match service configuration
//!
//! Loaded from TOML; every field has a built-in default so an absent or
//! partial file is valid.
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [matching]
//! k = 5
//! branch_timeout_ms = 1500
//!
//! [fusion.weights]
//! semantic = 0.5
//! context = 0.3
//! history = 0.2
//!
//! [storage]
//! image_root = "/var/lib/lfm/images"
//! history_path = "/var/lib/lfm/object_history.toml"
//! ```

use crate::error::{MatchError, MatchResult};
use crate::explain::ExplainabilityPackager;
use crate::fusion::FusionPolicy;
use crate::heatmap::SaliencyOverlayRenderer;
use crate::pipeline::orchestrator::{
    DEFAULT_BRANCH_TIMEOUT, DEFAULT_CANDIDATE_CONCURRENCY, DEFAULT_REQUEST_DEADLINE,
};
use crate::pipeline::PipelineConfig;
use crate::ranking::DEFAULT_TOP_K;
use crate::storage::ImageStore;
use lfm_common::config::{load_toml_config, resolve_config_path, LoggingConfig};
use lfm_common::time::millis_to_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "LFM_CONFIG";

/// Config file name looked up in the per-user config directory
pub const CONFIG_FILE_NAME: &str = "lfm-match.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub fusion: FusionConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Ranking and scheduling limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Shortlist length
    #[serde(default = "default_k")]
    pub k: usize,

    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,

    #[serde(default = "default_candidate_concurrency")]
    pub candidate_concurrency: usize,

    /// 0 disables the overall deadline
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    #[serde(default = "default_heatmap_timeout_ms")]
    pub heatmap_timeout_ms: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            branch_timeout_ms: default_branch_timeout_ms(),
            candidate_concurrency: default_candidate_concurrency(),
            request_deadline_ms: default_request_deadline_ms(),
            heatmap_timeout_ms: default_heatmap_timeout_ms(),
        }
    }
}

/// Nominal fusion weights keyed by branch name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, f64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
        }
    }
}

/// Where normalized images and feedback tables live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_image_root")]
    pub image_root: PathBuf,

    #[serde(default = "default_reliability_path")]
    pub reliability_path: PathBuf,

    /// Per-object feedback confidence
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_root: default_image_root(),
            reliability_path: default_reliability_path(),
            history_path: default_history_path(),
        }
    }
}

fn default_k() -> usize {
    DEFAULT_TOP_K
}

fn default_branch_timeout_ms() -> u64 {
    DEFAULT_BRANCH_TIMEOUT.as_millis() as u64
}

fn default_candidate_concurrency() -> usize {
    DEFAULT_CANDIDATE_CONCURRENCY
}

fn default_request_deadline_ms() -> u64 {
    DEFAULT_REQUEST_DEADLINE.as_millis() as u64
}

fn default_heatmap_timeout_ms() -> u64 {
    crate::explain::DEFAULT_HEATMAP_TIMEOUT.as_millis() as u64
}

fn default_weights() -> BTreeMap<String, f64> {
    [
        ("semantic", 0.4),
        ("negative_space", 0.15),
        ("context", 0.25),
        ("history", 0.2),
    ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lfm")
}

fn default_image_root() -> PathBuf {
    default_data_dir().join("images")
}

fn default_reliability_path() -> PathBuf {
    default_data_dir().join("reliability.toml")
}

fn default_history_path() -> PathBuf {
    default_data_dir().join("object_history.toml")
}

impl MatchConfig {
    /// Load from an explicit file
    pub fn load(path: &Path) -> MatchResult<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file (CLI → `LFM_CONFIG` → user config dir) and
    /// load it, or fall back to defaults when none exists
    pub fn resolve(cli_arg: Option<&Path>) -> MatchResult<Self> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR, CONFIG_FILE_NAME) {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::load(&path)
            }
            None => {
                info!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> MatchResult<()> {
        if self.matching.candidate_concurrency == 0 {
            return Err(MatchError::Config(
                "matching.candidate_concurrency must be at least 1".to_string(),
            ));
        }
        if self.matching.branch_timeout_ms == 0 {
            return Err(MatchError::Config(
                "matching.branch_timeout_ms must be at least 1".to_string(),
            ));
        }
        self.fusion_policy()
            .map_err(|e| MatchError::Config(format!("fusion.weights: {}", e)))?;
        Ok(())
    }

    pub fn fusion_policy(&self) -> MatchResult<FusionPolicy> {
        FusionPolicy::new(self.fusion.weights.clone())
    }

    pub fn heatmap_timeout(&self) -> Duration {
        millis_to_duration(self.matching.heatmap_timeout_ms)
    }

    /// Packager rendering saliency overlays into `store`, bounded by
    /// `heatmap_timeout_ms`
    pub fn explainer(&self, store: Arc<dyn ImageStore>) -> ExplainabilityPackager {
        ExplainabilityPackager::with_renderer(
            Arc::new(SaliencyOverlayRenderer::new(store)),
            self.heatmap_timeout(),
        )
    }

    /// Pipeline settings with the given (possibly reliability-adjusted) policy
    pub fn to_pipeline_config(&self, policy: FusionPolicy) -> PipelineConfig {
        let deadline_ms = self.matching.request_deadline_ms;
        PipelineConfig {
            policy,
            top_k: self.matching.k,
            branch_timeout: millis_to_duration(self.matching.branch_timeout_ms),
            candidate_concurrency: self.matching.candidate_concurrency,
            request_deadline: (deadline_ms > 0).then(|| millis_to_duration(deadline_ms)),
        }
    }
}
