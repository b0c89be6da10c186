//! Object storage boundary
//!
//! The engine only ever writes two kinds of objects: the normalized query
//! image and (via the heatmap renderer) explainability overlays. Both go
//! through `ImageStore`, keyed by a relative object path such as
//! `normalized/<request_id>.jpg`.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Object store error
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object path escapes the store or is empty
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

/// Write-only image store
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store `bytes` at `object_path`, returning the object's canonical URI
    async fn put(
        &self,
        object_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError>;
}

/// Filesystem-backed store rooted at a directory
///
/// URIs are `file://` URLs of the absolute object path.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, object_path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(object_path);
        let is_plain = !object_path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(StoreError::InvalidPath(object_path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(
        &self,
        object_path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StoreError> {
        let path = self.resolve(object_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        let absolute = tokio::fs::canonicalize(&path).await?;
        debug!(
            path = %absolute.display(),
            bytes = bytes.len(),
            content_type,
            "Stored object"
        );
        Ok(format!("file://{}", absolute.display()))
    }
}
