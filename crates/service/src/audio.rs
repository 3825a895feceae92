//! Audio object storage: the upload and URL-signing contract.
//!
//! The persisted `audio_url` on a response is an opaque storage key; signed
//! URLs are short-lived and derived on demand, never stored.

use std::path::PathBuf;

use async_trait::async_trait;
use canvass::{PipelineError, PipelineResult};
use chrono::Utc;
use url::Url;
use uuid::Uuid;

/// Keys produced by test fixtures and demo data; they resolve to a
/// structured "mock" reply instead of a signed URL.
pub const MOCK_URL_PREFIX: &str = "mock://";

#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Store `bytes` under `key`; returns the stored size.
    async fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<u64>;

    /// A short-lived read URL for `key`.
    fn signed_url(&self, key: &str, expires_secs: u64) -> PipelineResult<String>;

    fn storage_type(&self) -> &'static str;
}

/// Filesystem-backed store used in development and tests.
pub struct LocalAudioStore {
    root: PathBuf,
    public_base: Url,
}

impl LocalAudioStore {
    pub fn new(root: PathBuf, public_base: Url) -> Self {
        Self { root, public_base }
    }
}

#[async_trait]
impl AudioStore for LocalAudioStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> PipelineResult<u64> {
        if key.contains("..") {
            return Err(PipelineError::BadRequest(format!("invalid audio key {key}")));
        }
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Internal(format!("audio store mkdir: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Internal(format!("audio store write: {e}")))?;
        Ok(bytes.len() as u64)
    }

    fn signed_url(&self, key: &str, expires_secs: u64) -> PipelineResult<String> {
        let mut url = self
            .public_base
            .join(key)
            .map_err(|e| PipelineError::Internal(format!("audio url: {e}")))?;
        let expires = Utc::now().timestamp() + expires_secs as i64;
        url.query_pairs_mut()
            .append_pair("token", &Uuid::new_v4().to_string())
            .append_pair("expires", &expires.to_string());
        Ok(url.to_string())
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}
