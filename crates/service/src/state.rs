use std::collections::HashMap;
use std::sync::Arc;

use canvass::store::{ResponseStore, SurveyStore, UserStore};
use canvass_qc::{
    CompletionIngestor, DuplicateDetector, ReviewQueue, SessionManager, SetRotation,
};
use canvass_telephony::{CallEvent, ProviderDirectory, TenantConfig};
use tokio::sync::Mutex;

use crate::audio::AudioStore;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub surveys: Arc<dyn SurveyStore>,
    pub responses: Arc<dyn ResponseStore>,
    pub sessions: Arc<SessionManager>,
    pub ingestor: Arc<CompletionIngestor>,
    pub reviews: Arc<ReviewQueue>,
    pub dedup: Arc<DuplicateDetector>,
    pub sets: Arc<SetRotation>,
    pub telephony: Arc<ProviderDirectory>,
    pub tenants: Arc<HashMap<String, TenantConfig>>,
    pub audio: Arc<dyn AudioStore>,
    /// Normalized webhook updates keyed by call id.
    pub call_log: Arc<Mutex<HashMap<String, CallEvent>>>,
}
