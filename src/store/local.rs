//! Object storage on the local filesystem.
//!
//! Objects live under a root directory at their storage path; "signed" URLs
//! are plain `file://` URLs with an expiry hint, which is enough for a
//! rasteriser running on the same host.

use super::{ObjectStorage, StoreResult};
use crate::error::IngestError;
use crate::model::SignedUrl;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path under the root, refusing anything that escapes it.
    pub fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.trim().is_empty() || escapes {
            return Err(IngestError::Validation(format!(
                "storage path '{path}' is not a relative path"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn file_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        let full = self.resolve(path)?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        Ok(SignedUrl {
            url: format!("file://{}", full.display()),
            expires_at,
        })
    }
}

#[async_trait]
impl ObjectStorage for LocalDirStorage {
    async fn signed_upload_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        self.file_url(path, ttl)
    }

    async fn signed_download_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        let full = self.resolve(path)?;
        if !tokio::fs::try_exists(&full)
            .await
            .map_err(|e| IngestError::storage("sign_download", e))?
        {
            return Err(IngestError::storage(
                "sign_download",
                format!("no object at '{path}'"),
            ));
        }
        self.file_url(path, ttl)
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| IngestError::storage("get_object", format!("{}: {e}", full.display())))
    }

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::storage("put_object", e))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .map_err(|e| IngestError::storage("put_object", format!("{}: {e}", full.display())))?;
        debug!("Stored {} bytes ({}) at {}", bytes.len(), content_type, full.display());
        Ok(())
    }
}
