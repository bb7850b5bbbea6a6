//! Build requests sent to workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::job::JobType;
use crate::report::WorkerStatus;
use crate::BuildId;

/// Cookie identifying one build on a worker, e.g. `PACKAGEBUILD-42`.
pub fn build_cookie(job_type: JobType, build_id: BuildId) -> String {
    format!("{}-{}", job_type.as_str(), build_id)
}

/// Everything a worker needs to start a build.
///
/// Rebuilt from the build record on every dispatch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub cookie: String,
    /// Builder type understood by the worker's daemon.
    pub builder_type: String,
    pub chroot_hash: String,
    /// Logical filename to content hash.
    pub filemap: BTreeMap<String, String>,
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Worker's answer to a build-start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: WorkerStatus,
    #[serde(default)]
    pub info: String,
}

/// Basic credentials a worker presents when fetching a restricted file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub cookie: String,
    pub info: String,
    /// Number of files the worker was asked to cache.
    pub staged_files: usize,
}
