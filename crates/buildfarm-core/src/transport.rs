//! Worker transport trait.
//!
//! A transport talks to exactly one worker. Workers are untrusted: every
//! answer is validated by the caller and every call is expected to be bounded
//! by a timeout inside the implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::dispatch::{Credentials, DispatchRequest, StartResponse};
use crate::report::StatusReport;
use crate::worker::Worker;
use crate::Result;

#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Round-trip a message to check the worker answers.
    async fn echo(&self, message: &str) -> Result<String>;

    /// Ask the worker to fetch `url` into its cache under `content_hash`.
    async fn cache_file(
        &self,
        content_hash: &str,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()>;

    /// Start a build. The worker answers with its new status.
    async fn start_build(&self, request: &DispatchRequest) -> Result<StartResponse>;

    async fn poll_status(&self) -> Result<StatusReport>;

    async fn abort(&self) -> Result<()>;

    /// Discard the finished build and return to IDLE.
    async fn clean(&self) -> Result<()>;

    /// Fetch a file from the worker's cache.
    async fn get_file(&self, content_hash: &str) -> Result<Bytes>;

    /// Reset action: restart the worker's VM from a clean image.
    async fn resume(&self) -> Result<()>;
}

/// Creates transports for workers.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, worker: &Worker) -> Arc<dyn WorkerTransport>;
}
