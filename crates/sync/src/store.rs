//! Local persistence contract for queued interviews and cached surveys.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use canvass::domain::Survey;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::api::{OfflineInterview, SyncStatus};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(String),
    #[error("io error: {0}")]
    Io(String),
}

/// Device-local storage for the sync queue. Implementations persist to the
/// device database; the in-memory one backs tests.
#[async_trait]
pub trait OfflineStore: Send + Sync + 'static {
    /// Interviews still owed to the server, oldest first: `pending` plus
    /// `failed` from earlier runs.
    async fn list_unsynced(&self) -> Result<Vec<OfflineInterview>, SyncError>;

    /// Persist the full record. The engine writes `response_id` and the
    /// `synced` status through a single call here, never separately.
    async fn update(&self, interview: &OfflineInterview) -> Result<(), SyncError>;

    /// Delete a synced interview record.
    async fn remove(&self, id: &str) -> Result<(), SyncError>;

    /// The locally cached survey structure, used to rebuild the final
    /// response array.
    async fn cached_survey(&self, survey_id: &str) -> Result<Option<Survey>, SyncError>;
}

/// In-memory `OfflineStore`.
#[derive(Clone, Default)]
pub struct MemoryOfflineStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    interviews: BTreeMap<String, OfflineInterview>,
    surveys: HashMap<String, Survey>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_interview(&self, interview: OfflineInterview) {
        let mut inner = self.inner.lock().await;
        inner.interviews.insert(interview.id.clone(), interview);
    }

    pub async fn put_survey(&self, survey: Survey) {
        let mut inner = self.inner.lock().await;
        inner.surveys.insert(survey.id.clone(), survey);
    }

    pub async fn get_interview(&self, id: &str) -> Option<OfflineInterview> {
        let inner = self.inner.lock().await;
        inner.interviews.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.interviews.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn list_unsynced(&self) -> Result<Vec<OfflineInterview>, SyncError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .interviews
            .values()
            .filter(|i| matches!(i.status, SyncStatus::Pending | SyncStatus::Failed))
            .cloned()
            .collect())
    }

    async fn update(&self, interview: &OfflineInterview) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner
            .interviews
            .insert(interview.id.clone(), interview.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.interviews.remove(id);
        Ok(())
    }

    async fn cached_survey(&self, survey_id: &str) -> Result<Option<Survey>, SyncError> {
        let inner = self.inner.lock().await;
        Ok(inner.surveys.get(survey_id).cloned())
    }
}
