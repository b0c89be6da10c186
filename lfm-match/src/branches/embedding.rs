//! Embedding Branch
//!
//! Cosine similarity between the query's and candidate's embedding under one
//! key (e.g. `"semantic"`, `"negative_space"`). Negative cosine means the
//! items are dissimilar, not "anti-similar", so it is floored at 0.

use crate::types::{BranchError, BranchScorer, CandidateDescriptor, QueryDescriptor};
use async_trait::async_trait;

/// Added to each norm so zero vectors do not divide by zero
const NORM_EPSILON: f64 = 1e-6;

/// Cosine similarity branch over one named embedding
#[derive(Debug, Clone)]
pub struct EmbeddingBranch {
    name: String,
    embedding_key: String,
}

impl EmbeddingBranch {
    /// `name` is the branch name used in fusion weights; `embedding_key`
    /// selects the vector in both descriptors
    pub fn new(name: impl Into<String>, embedding_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            embedding_key: embedding_key.into(),
        }
    }
}

/// Cosine similarity of two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / ((norm_a.sqrt() + NORM_EPSILON) * (norm_b.sqrt() + NORM_EPSILON))
}

#[async_trait]
impl BranchScorer for EmbeddingBranch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn compare(
        &self,
        query: &QueryDescriptor,
        candidate: &CandidateDescriptor,
    ) -> Result<f64, BranchError> {
        let q = query
            .embeddings
            .get(&self.embedding_key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BranchError::MissingFeature(format!("query embedding '{}'", self.embedding_key))
            })?;
        let c = candidate
            .embeddings
            .get(&self.embedding_key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BranchError::MissingFeature(format!(
                    "candidate {} embedding '{}'",
                    candidate.object_id, self.embedding_key
                ))
            })?;

        if q.len() != c.len() {
            return Err(BranchError::DimensionMismatch {
                query: q.len(),
                candidate: c.len(),
            });
        }

        Ok(cosine_similarity(q, c).max(0.0))
    }
}
