//! Core domain types and traits for the build farm.
//!
//! This crate contains:
//! - Identifiers for workers, jobs and builds
//! - The worker, job and build records and their status enums
//! - Status reports and dispatch requests exchanged with workers
//! - Collaborator traits (worker transport, librarian, notifier)

pub mod artifact;
pub mod build;
pub mod dispatch;
pub mod error;
pub mod id;
pub mod job;
pub mod notify;
pub mod report;
pub mod transport;
pub mod worker;

pub use error::{Error, Result};
pub use id::{BuildId, JobId, WorkerId};
