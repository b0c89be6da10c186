//! End-to-end match requests through `MatchPipeline`

mod helpers;

use async_trait::async_trait;
use futures::stream;
use helpers::{candidate, catalog, query, Outcome, TableBranch};
use lfm_match::branches::{HistoryBranch, ObjectHistory};
use lfm_match::explain::{ExplainabilityPackager, HeatmapRenderer, RenderError};
use lfm_match::storage::{ImageStore, LocalImageStore, StoreError};
use lfm_match::{
    BranchScorer, CandidateDescriptor, FusionPolicy, MatchError, MatchEvent, MatchPipeline,
    MatchConfig, PipelineConfig, ReliabilityTable, ResultStatus, Signal,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn scenario_policy() -> FusionPolicy {
    FusionPolicy::new([("vision", 0.5), ("embedding", 0.3), ("metadata", 0.2)]).unwrap()
}

fn config(policy: FusionPolicy, top_k: usize) -> PipelineConfig {
    PipelineConfig {
        policy,
        top_k,
        request_deadline: None,
        ..Default::default()
    }
}

// ============================================================================
// Fusion scenarios
// ============================================================================

#[tokio::test]
async fn test_all_branches_succeed() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![
            TableBranch::constant("vision", 0.8),
            TableBranch::constant("embedding", 0.6),
            TableBranch::constant("metadata", 0.9),
        ],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    let fusion = &result.fusion_summary;
    assert!(
        (fusion.confidence - 0.76).abs() < 1e-9,
        "Expected 0.76, got {}",
        fusion.confidence
    );
    assert_eq!(fusion.signal, Signal::Fused);
    assert!((fusion.applied_weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
    assert_eq!(result.branch_confidences.get("metadata"), Some(&0.9));
    assert_eq!(result.status, ResultStatus::Complete);
    assert!(result.explainability.summary.contains("'vision'"));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_branch_renormalizes() {
    let metadata = TableBranch::new(
        "metadata",
        Outcome::Delayed(Duration::from_secs(3600), 0.9),
    );
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![
            TableBranch::constant("vision", 0.8),
            TableBranch::constant("embedding", 0.6),
            Arc::new(metadata),
        ],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    let fusion = &result.fusion_summary;
    assert!(
        (fusion.confidence - 0.725).abs() < 1e-9,
        "Expected 0.725, got {}",
        fusion.confidence
    );
    assert!((fusion.applied_weights["vision"] - 0.625).abs() < 1e-9);
    assert!((fusion.applied_weights["embedding"] - 0.375).abs() < 1e-9);
    assert!(!fusion.applied_weights.contains_key("metadata"));
    assert!(!result.branch_confidences.contains_key("metadata"));
    assert!(result
        .explainability
        .summary
        .contains("1 of 3 branches were unavailable"));
}

#[tokio::test]
async fn test_shortlist_keeps_best_two() {
    let vision = TableBranch::new("vision", Outcome::Fail)
        .with("A", Outcome::Score(0.9))
        .with("B", Outcome::Score(0.4))
        .with("C", Outcome::Score(0.95))
        .with("D", Outcome::Score(0.4));
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 2),
        vec![Arc::new(vision)],
    )
    .unwrap();

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["A", "B", "C", "D"])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let ids: Vec<&str> = result.top_k.iter().map(|m| m.object_id.as_str()).collect();
    assert_eq!(ids, vec!["C", "A"]);
    assert_eq!(result.top_k[0].score, 0.95);
    assert_eq!(result.top_k[1].score, 0.9);
    assert!((result.fusion_summary.confidence - 0.95).abs() < 1e-12);
}

#[tokio::test]
async fn test_empty_catalog() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap();

    let result = pipeline
        .run(
            query(),
            stream::iter(Vec::<CandidateDescriptor>::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.top_k.is_empty());
    assert_eq!(result.fusion_summary.confidence, 0.0);
    assert_eq!(result.status, ResultStatus::Complete);
    assert_eq!(
        result.explainability.summary,
        "No candidates were available for comparison."
    );
}

#[tokio::test]
async fn test_zero_k_returns_empty_shortlist() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 0),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(catalog(&["a", "b"])), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.top_k.is_empty());
    assert!(result.fusion_summary.is_no_signal());
}

#[tokio::test]
async fn test_unweighted_branches_fall_back_to_equal_weights() {
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("unused", 1.0)]).unwrap(), 10),
        vec![
            TableBranch::constant("vision", 0.2),
            TableBranch::constant("embedding", 0.6),
        ],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    assert!((result.fusion_summary.confidence - 0.4).abs() < 1e-9);
    assert_eq!(result.fusion_summary.applied_weights.len(), 2);
}

// ============================================================================
// Ranking properties
// ============================================================================

#[tokio::test]
async fn test_shortlist_independent_of_arrival_order() {
    let ids = ["k", "b", "x", "a", "m", "c", "z", "d"];
    let make = || {
        let mut vision = TableBranch::new("vision", Outcome::Score(0.1));
        for (i, id) in ids.iter().enumerate() {
            // Pairs of equal scores exercise the object_id tie-break
            vision = vision.with(id, Outcome::Score(0.2 + (i / 2) as f64 * 0.2));
        }
        MatchPipeline::new(
            PipelineConfig {
                candidate_concurrency: 3,
                ..config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 5)
            },
            vec![Arc::new(vision) as Arc<dyn BranchScorer>],
        )
        .unwrap()
    };

    let forward = make()
        .run(query(), stream::iter(catalog(&ids)), CancellationToken::new())
        .await
        .unwrap();

    let mut reversed_ids = ids;
    reversed_ids.reverse();
    let reversed = make()
        .run(
            query(),
            stream::iter(catalog(&reversed_ids)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(forward.top_k, reversed.top_k);
    assert_eq!(forward.top_k.len(), 5);
    for pair in forward.top_k.windows(2) {
        assert!(
            pair[0].score > pair[1].score
                || (pair[0].score == pair[1].score && pair[0].object_id < pair[1].object_id),
            "Shortlist out of order: {:?}",
            forward.top_k
        );
    }
}

#[tokio::test]
async fn test_all_branches_failing_candidate_ranks_at_zero() {
    let vision = TableBranch::new("vision", Outcome::Score(0.7)).with("broken", Outcome::Fail);
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 10),
        vec![Arc::new(vision)],
    )
    .unwrap();

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["broken", "fine"])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.top_k.len(), 2);
    assert_eq!(result.top_k[0].object_id, "fine");
    assert_eq!(result.top_k[1].object_id, "broken");
    assert_eq!(result.top_k[1].score, 0.0);
}

// ============================================================================
// Cancellation and deadlines
// ============================================================================

fn slow_catalog_pipeline(request_deadline: Option<Duration>) -> MatchPipeline {
    let vision = TableBranch::new("vision", Outcome::Score(0.5))
        .with("fast-1", Outcome::Score(0.9))
        .with("fast-2", Outcome::Score(0.8))
        .with("slow", Outcome::Delayed(Duration::from_secs(3600), 1.0));
    MatchPipeline::new(
        PipelineConfig {
            policy: FusionPolicy::new([("vision", 1.0)]).unwrap(),
            branch_timeout: Duration::from_secs(7200),
            request_deadline,
            ..Default::default()
        },
        vec![Arc::new(vision)],
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_returns_partial_result() {
    let (tx, mut rx) = mpsc::channel(64);
    let pipeline = slow_catalog_pipeline(None).with_events(tx);
    let cancel = CancellationToken::new();

    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        let mut scored = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, MatchEvent::CandidateScored { .. }) {
                scored += 1;
                if scored == 2 {
                    watcher_cancel.cancel();
                }
            }
        }
    });

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["slow", "fast-1", "fast-2"])),
            cancel,
        )
        .await
        .unwrap();
    drop(pipeline);
    watcher.await.unwrap();

    assert_eq!(result.status, ResultStatus::Partial);
    assert!(result.is_partial());
    let ids: Vec<&str> = result.top_k.iter().map(|m| m.object_id.as_str()).collect();
    assert_eq!(ids, vec!["fast-1", "fast-2"]);
    assert!((result.fusion_summary.confidence - 0.9).abs() < 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_returns_partial_result() {
    let pipeline = slow_catalog_pipeline(Some(Duration::from_secs(5)));

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["fast-1", "slow", "fast-2"])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ResultStatus::Partial);
    let ids: Vec<&str> = result.top_k.iter().map(|m| m.object_id.as_str()).collect();
    assert_eq!(ids, vec!["fast-1", "fast-2"]);
}

#[tokio::test(start_paused = true)]
async fn test_undrained_event_channel_does_not_stall_request() {
    let (tx, mut rx) = mpsc::channel(1);
    let pipeline = slow_catalog_pipeline(Some(Duration::from_secs(5))).with_events(tx);

    let result = tokio::time::timeout(
        Duration::from_secs(3600),
        pipeline.run(
            query(),
            stream::iter(catalog(&["fast-1", "slow", "fast-2"])),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("request should finish by its deadline")
    .unwrap();
    drop(pipeline);

    assert_eq!(result.status, ResultStatus::Partial);
    assert_eq!(result.top_k.len(), 2);

    // Only the first event fit; the rest were dropped instead of waited on
    assert!(matches!(
        rx.recv().await,
        Some(MatchEvent::RequestStarted { .. })
    ));
    assert!(rx.recv().await.is_none());
}

// ============================================================================
// Input validation
// ============================================================================

#[tokio::test]
async fn test_blank_source_uri_rejected() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap();

    let mut bad = query();
    bad.source_uri = "  ".to_string();

    let result = pipeline
        .run(bad, stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(MatchError::InvalidInput(_))));
}

#[tokio::test]
async fn test_undecodable_image_rejected() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap();

    let mut bad = query();
    bad.bytes = vec![0u8; 128];

    let result = pipeline
        .run(bad, stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(MatchError::InvalidInput(_))));
}

// ============================================================================
// Storage and explainability
// ============================================================================

struct UnavailableStore;

#[async_trait]
impl ImageStore for UnavailableStore {
    async fn put(
        &self,
        _object_path: &str,
        _bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StoreError> {
        Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "bucket offline",
        )))
    }
}

struct PathRenderer;

#[async_trait]
impl HeatmapRenderer for PathRenderer {
    async fn render(
        &self,
        request_id: &str,
        _normalized_uri: &str,
        object_id: &str,
    ) -> Result<String, RenderError> {
        Ok(format!("heatmaps/{}/{}.jpg", request_id, object_id))
    }
}

#[tokio::test]
async fn test_normalized_image_stored() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap()
    .with_store(Arc::new(LocalImageStore::new(temp_dir.path())));

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    let expected_suffix = format!("normalized/{}.jpg", result.request_id);
    assert!(result.normalized_uri.starts_with("file://"));
    assert!(result.normalized_uri.ends_with(&expected_suffix));

    let stored = std::fs::read(temp_dir.path().join(&expected_suffix)).unwrap();
    assert_eq!(&stored[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn test_store_failure_falls_back_to_source_uri() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap()
    .with_store(Arc::new(UnavailableStore));

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.normalized_uri, "file:///uploads/raw/query.png");
    assert_eq!(result.top_k.len(), 1);
}

#[tokio::test]
async fn test_heatmap_for_top_candidate() {
    let vision = TableBranch::new("vision", Outcome::Score(0.3)).with("best", Outcome::Score(0.9));
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 10),
        vec![Arc::new(vision)],
    )
    .unwrap()
    .with_explainer(ExplainabilityPackager::with_renderer(
        Arc::new(PathRenderer),
        Duration::from_secs(1),
    ));

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["other", "best"])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        result.explainability.heatmap_object_path,
        Some(format!("heatmaps/{}/best.jpg", result.request_id))
    );
}

#[tokio::test]
async fn test_saliency_overlay_stored_for_request() {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn ImageStore> = Arc::new(LocalImageStore::new(temp_dir.path()));
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap()
    .with_explainer(MatchConfig::default().explainer(Arc::clone(&store)))
    .with_store(store);

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    let expected = format!("heatmaps/{}.jpg", result.request_id);
    assert_eq!(result.explainability.heatmap_object_path.as_deref(), Some(expected.as_str()));

    let overlay = image::open(temp_dir.path().join(&expected)).unwrap();
    assert_eq!((overlay.width(), overlay.height()), (32, 24));
}

#[tokio::test]
async fn test_saliency_overlay_skipped_without_stored_image() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 1.0)]).unwrap(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap()
    .with_explainer(
        MatchConfig::default().explainer(Arc::new(LocalImageStore::new(temp_dir.path()))),
    )
    .with_store(Arc::new(UnavailableStore));

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    // The raw upload URI is not readable, so only the summary survives
    assert!(result.explainability.heatmap_object_path.is_none());
    assert!(result.explainability.summary.contains("obj-1"));
    assert_eq!(result.top_k.len(), 1);
}

// ============================================================================
// Result serialization and reliability
// ============================================================================

#[tokio::test]
async fn test_result_json_shape() {
    let pipeline = MatchPipeline::new(
        config(scenario_policy(), 10),
        vec![TableBranch::constant("vision", 0.8)],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(vec![candidate("obj-1")]), CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(&result).unwrap();
    for field in [
        "request_id",
        "timestamp",
        "normalized_uri",
        "fusion_summary",
        "branch_confidences",
        "explainability",
        "top_k",
        "status",
    ] {
        assert!(json.get(field).is_some(), "missing field {}", field);
    }
    assert_eq!(json["status"], "complete");
    assert_eq!(json["fusion_summary"]["signal"], "fused");
    assert_eq!(json["top_k"][0]["object_id"], "obj-1");
}

#[tokio::test]
async fn test_negative_feedback_reduces_branch_influence() {
    let mut table = ReliabilityTable::new();
    for _ in 0..5 {
        table.record_feedback(&["vision"], false);
    }
    let policy = table.effective_policy(&scenario_policy()).unwrap();

    let pipeline = MatchPipeline::new(
        config(policy, 10),
        vec![
            TableBranch::constant("vision", 0.8),
            TableBranch::constant("embedding", 0.6),
            TableBranch::constant("metadata", 0.9),
        ],
    )
    .unwrap();

    let result = pipeline
        .run(query(), stream::iter(catalog(&["obj-1"])), CancellationToken::new())
        .await
        .unwrap();

    let fusion = &result.fusion_summary;
    assert!(fusion.applied_weights["vision"] < 0.5);
    assert!((fusion.applied_weights.values().sum::<f64>() - 1.0).abs() < 1e-6);
    assert!(
        (fusion.confidence - 0.752).abs() < 1e-9,
        "Expected 0.752, got {}",
        fusion.confidence
    );
}

#[tokio::test]
async fn test_rejected_object_ranks_below_unrated_peer() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("object_history.toml");

    let mut history = ObjectHistory::new();
    history.record_feedback("wallet-a", false);
    history.record_feedback("wallet-c", true);
    history.save(&path).unwrap();

    let pipeline = MatchPipeline::new(
        config(FusionPolicy::new([("vision", 0.8), ("history", 0.2)]).unwrap(), 10),
        vec![
            TableBranch::constant("vision", 0.6),
            Arc::new(HistoryBranch::new(ObjectHistory::load(&path).unwrap())),
        ],
    )
    .unwrap();

    let result = pipeline
        .run(
            query(),
            stream::iter(catalog(&["wallet-a", "wallet-b", "wallet-c"])),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let order: Vec<&str> = result.top_k.iter().map(|m| m.object_id.as_str()).collect();
    assert_eq!(order, vec!["wallet-c", "wallet-b", "wallet-a"]);

    // 0.8 * 0.6 + 0.2 * 0.55
    assert!(
        (result.fusion_summary.confidence - 0.59).abs() < 1e-9,
        "Expected 0.59, got {}",
        result.fusion_summary.confidence
    );
    assert!((result.branch_confidences["history"] - 0.55).abs() < 1e-9);
}
