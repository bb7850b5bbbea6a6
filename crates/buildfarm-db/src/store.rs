//! The job store contract.

use async_trait::async_trait;
use buildfarm_core::build::{Build, BuildSpec};
use buildfarm_core::job::{Candidate, Job, JobStatus};
use buildfarm_core::worker::{NewWorker, Worker};
use buildfarm_core::{BuildId, JobId, WorkerId};

use crate::DbResult;

/// A build to be queued.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub spec: BuildSpec,
    pub score: i32,
    pub requesting_principal: Option<String>,
}

/// Persistent state shared by all scanners.
///
/// `try_claim` is the only way a job becomes RUNNING and must be atomic:
/// of any number of concurrent callers for the same job at most one wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a worker, or update the static fields of an existing one with
    /// the same name. Health and failure counters are left untouched.
    async fn register_worker(&self, worker: NewWorker) -> DbResult<Worker>;
    async fn list_workers(&self) -> DbResult<Vec<Worker>>;
    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker>;
    async fn get_worker_by_name(&self, name: &str) -> DbResult<Worker>;
    async fn save_worker(&self, worker: &Worker) -> DbResult<()>;

    /// Count one more failure against `worker` and return it as stored.
    async fn add_worker_failure(&self, worker: WorkerId) -> DbResult<Worker>;

    /// Record a reset attempt. Success clears the reset failure count,
    /// failure bumps it. Nothing else about the worker is touched.
    async fn record_reset(&self, worker: WorkerId, succeeded: bool) -> DbResult<Worker>;

    /// Clear both failure counters.
    async fn clear_worker_failures(&self, worker: WorkerId) -> DbResult<()>;

    /// Take `worker` out of service. Returns `None` if it already was.
    async fn disable_worker(&self, worker: WorkerId, reason: &str) -> DbResult<Option<Worker>>;

    /// Put `worker` back into service. A worker coming back from being
    /// disabled starts with clean counters.
    async fn enable_worker(&self, worker: WorkerId) -> DbResult<Worker>;

    /// Create a build and its WAITING job.
    async fn queue_build(&self, build: NewBuild) -> DbResult<Candidate>;

    /// WAITING, unclaimed jobs compatible with `worker`, best first.
    async fn candidates(&self, worker: &Worker) -> DbResult<Vec<Candidate>>;

    /// Claim `job` for `worker` if it is still WAITING and unclaimed. The
    /// build moves to BUILDING. Returns `None` when another worker won.
    async fn try_claim(&self, job: JobId, worker: WorkerId) -> DbResult<Option<Candidate>>;

    /// Put a claimed job back in the queue and its build back to NEEDSBUILD.
    async fn release(&self, job: JobId) -> DbResult<()>;

    /// Drop the claim and give the job a terminal status.
    async fn finish(&self, job: JobId, status: JobStatus) -> DbResult<()>;

    /// Reset a build's job to WAITING with a fresh score.
    async fn requeue(&self, build: BuildId, score: i32) -> DbResult<Job>;

    async fn rescore(&self, job: JobId, score: i32, manual: bool) -> DbResult<Job>;

    /// Fail a job that is still WAITING and unclaimed. Returns false if a
    /// worker claimed it or it finished in the meantime.
    async fn withdraw(&self, job: JobId) -> DbResult<bool>;

    async fn get_job(&self, id: JobId) -> DbResult<Job>;
    async fn job_for_build(&self, build: BuildId) -> DbResult<Job>;
    async fn save_job(&self, job: &Job) -> DbResult<()>;

    async fn get_build(&self, id: BuildId) -> DbResult<Build>;
    async fn save_build(&self, build: &Build) -> DbResult<()>;

    /// Count one more failed attempt against `build`, returning the new count.
    async fn add_build_failure(&self, build: BuildId) -> DbResult<u32>;

    /// Move a BUILDING build to CANCELLING. Returns false if it is not
    /// building any more.
    async fn mark_cancelling(&self, build: BuildId) -> DbResult<bool>;

    /// The job `worker` currently holds a claim on, if any.
    async fn current_job_for(&self, worker: WorkerId) -> DbResult<Option<Candidate>>;
}

/// Queue fields derived from the build's requirements.
pub(crate) fn job_requirements(spec: &BuildSpec) -> (Option<String>, Option<bool>) {
    (
        spec.processor().map(|p| p.to_string()),
        spec.required_virtualization(),
    )
}
