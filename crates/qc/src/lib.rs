//! Domain services for the Canvass pipeline: interview sessions, completion
//! ingestion with auto-rejection, QC batching and sampling, the review
//! queue with expiring leases, duplicate reconciliation, and CATI set
//! rotation.

pub mod batch;
pub mod complete;
pub mod dedup;
pub mod review;
pub mod rules;
pub mod session;
pub mod sets;

pub use batch::BatchManager;
pub use complete::CompletionIngestor;
pub use dedup::DuplicateDetector;
pub use review::ReviewQueue;
pub use session::SessionManager;
pub use sets::SetRotation;
