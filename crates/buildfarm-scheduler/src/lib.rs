//! Job selection, dispatch and build lifecycle for the build farm.
//!
//! One scanner task runs per worker. Each cycle it either follows the build
//! the worker holds (polling, cancellation, silence detection) or picks the
//! best compatible job from the shared queue and dispatches it. Claims go
//! through `JobStore::try_claim`, so concurrent scanners never share a job.

pub mod admin;
pub mod behavior;
pub mod dispatcher;
pub mod failure;
pub mod farm;
pub mod lifecycle;
pub mod manager;
pub mod scanner;
pub mod selector;
pub mod signer;

#[cfg(test)]
mod testing;

pub use admin::Admin;
pub use behavior::{BehaviorRegistry, BuildBehavior};
pub use farm::{Farm, ScanContext, SchedulerSettings};
pub use manager::{FarmManager, ManagerHandle, ReportRouter};
pub use scanner::WorkerScanner;
pub use signer::PrivateFileSigner;
