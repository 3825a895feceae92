//! Collector-side offline synchronization engine.
//!
//! Completed interviews captured without connectivity are queued locally and
//! uploaded when the device comes back online: audio first (with retry and
//! exponential backoff), then the completion payload. Server-side duplicates
//! are treated as success: a user's data is never lost and never submitted
//! twice.

pub mod api;
pub mod backend;
pub mod classify;
pub mod engine;
pub mod store;

pub use api::{
    AudioUploadStatus, OfflineInterview, SyncConfig, SyncEvent, SyncProgress, SyncSnapshot,
    SyncStage, SyncStatus,
};
pub use backend::{BackendError, CompletionPayload, CompletionReply, HttpBackend, SyncBackend};
pub use engine::SyncEngine;
pub use store::{MemoryOfflineStore, OfflineStore, SyncError};
