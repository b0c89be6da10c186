//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use lfm_match::{BranchError, BranchScorer, CandidateDescriptor, QueryDescriptor, QueryImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Solid-color PNG
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, image::Rgb([30, 90, 160]));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn query() -> QueryImage {
    QueryImage {
        source_uri: "file:///uploads/raw/query.png".to_string(),
        bytes: png(32, 24),
        descriptor: QueryDescriptor::default(),
    }
}

pub fn candidate(id: &str) -> CandidateDescriptor {
    CandidateDescriptor {
        object_id: id.to_string(),
        ..Default::default()
    }
}

pub fn catalog(ids: &[&str]) -> Vec<CandidateDescriptor> {
    ids.iter().map(|id| candidate(id)).collect()
}

/// Per-candidate branch behavior
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Score(f64),
    Fail,
    /// Sleep, then score
    Delayed(Duration, f64),
}

/// Branch whose result depends on the candidate's object_id
pub struct TableBranch {
    name: &'static str,
    outcomes: HashMap<String, Outcome>,
    fallback: Outcome,
}

impl TableBranch {
    pub fn new(name: &'static str, fallback: Outcome) -> Self {
        Self {
            name,
            outcomes: HashMap::new(),
            fallback,
        }
    }

    pub fn with(mut self, object_id: &str, outcome: Outcome) -> Self {
        self.outcomes.insert(object_id.to_string(), outcome);
        self
    }

    pub fn constant(name: &'static str, confidence: f64) -> Arc<dyn BranchScorer> {
        Arc::new(Self::new(name, Outcome::Score(confidence)))
    }
}

#[async_trait]
impl BranchScorer for TableBranch {
    fn name(&self) -> &str {
        self.name
    }

    async fn compare(
        &self,
        _query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError> {
        let outcome = self
            .outcomes
            .get(&candidate.object_id)
            .copied()
            .unwrap_or(self.fallback);
        match outcome {
            Outcome::Score(confidence) => Ok(confidence),
            Outcome::Fail => Err(BranchError::Service("backend unavailable".to_string())),
            Outcome::Delayed(delay, confidence) => {
                tokio::time::sleep(delay).await;
                Ok(confidence)
            }
        }
    }
}

/// Branch that records the peak number of concurrent invocations
pub struct GaugeBranch {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl GaugeBranch {
    pub fn new(delay: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BranchScorer for GaugeBranch {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn compare(
        &self,
        _query: &QueryDescriptor,
        _candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(0.5)
    }
}
