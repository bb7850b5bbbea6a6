//! HTTP API for the build farm.
//!
//! Operator endpoints for workers, jobs and builds, plus the endpoint workers
//! push status reports to.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
