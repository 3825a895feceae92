//! Core library for the Canvass survey response pipeline.
//!
//! This crate owns the domain model (surveys, sessions, responses, QC
//! batches), the dynamically typed answer values with their normalization
//! rules, the error kinds carried end-to-end, and the logical storage
//! contracts. Concrete services live in the sibling crates and talk to
//! storage exclusively through the traits defined here.

pub mod config;
pub mod domain;
pub mod error;
pub mod memory;
pub mod store;
pub mod value;

pub use error::{PipelineError, PipelineResult, StoreError};
pub use value::ResponseValue;
