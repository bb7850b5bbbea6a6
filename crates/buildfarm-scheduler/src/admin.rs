//! Operator actions on workers, jobs and builds.

use buildfarm_core::build::{Build, BuildSpec, BuildStatus};
use buildfarm_core::job::{Candidate, Job};
use buildfarm_core::worker::Worker;
use buildfarm_core::{BuildId, Error, JobId, Result};
use buildfarm_db::NewBuild;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::farm::Farm;
use crate::lifecycle::complete;

const CANCEL_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct Admin {
    farm: Arc<Farm>,
}

impl Admin {
    pub fn new(farm: Arc<Farm>) -> Self {
        Self { farm }
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        Ok(self.farm.store.list_workers().await?)
    }

    pub async fn disable_worker(&self, name: &str, reason: &str) -> Result<Worker> {
        let worker = self.farm.store.get_worker_by_name(name).await?;
        let Some(worker) = self.farm.store.disable_worker(worker.id, reason).await? else {
            debug!(worker = %worker.name, "Worker already disabled");
            return Ok(self.farm.store.get_worker(worker.id).await?);
        };
        warn!(worker = %worker.name, reason, "Worker disabled by operator");
        if let Err(e) = self.farm.notifier.worker_disabled(&worker, reason).await {
            warn!(worker = %worker.name, error = %e, "Failed to notify operators");
        }
        Ok(worker)
    }

    pub async fn enable_worker(&self, name: &str) -> Result<Worker> {
        let worker = self.farm.store.get_worker_by_name(name).await?;
        let worker = self.farm.store.enable_worker(worker.id).await?;
        info!(worker = %worker.name, "Worker enabled");
        Ok(worker)
    }

    /// Queue a new build, scored by its job type.
    pub async fn queue_build(
        &self,
        spec: BuildSpec,
        requesting_principal: Option<String>,
    ) -> Result<Candidate> {
        let score = self.farm.behaviors.get(spec.job_type()).score(&spec);
        let queued = self
            .farm
            .store
            .queue_build(NewBuild {
                spec,
                score,
                requesting_principal,
            })
            .await?;
        info!(
            job_id = %queued.job.id,
            build_id = %queued.build.id,
            score,
            "Build queued"
        );
        Ok(queued)
    }

    /// Set a job's score by hand.
    pub async fn rescore(&self, job_id: JobId, score: i32) -> Result<Job> {
        let job = self.farm.store.get_job(job_id).await?;
        let build = self.farm.store.get_build(job.build_id).await?;
        if !build.can_be_rescored() {
            return Err(Error::Conflict(format!(
                "build {} is {} and cannot be rescored",
                build.id, build.status
            )));
        }
        let job = self.farm.store.rescore(job_id, score, true).await?;
        info!(job_id = %job.id, score, "Job rescored");
        Ok(job)
    }

    /// Cancel a build. A queued build is cancelled at once; a running one is
    /// marked CANCELLING and its scanner aborts it.
    pub async fn cancel_build(&self, build_id: BuildId) -> Result<Build> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut build = self.farm.store.get_build(build_id).await?;
            if !build.can_be_cancelled() {
                return Err(Error::Conflict(format!(
                    "build {} is {} and cannot be cancelled",
                    build.id, build.status
                )));
            }
            let job = self.farm.store.job_for_build(build_id).await?;

            if self.farm.store.withdraw(job.id).await? {
                complete(&self.farm, job.id, &mut build, BuildStatus::Cancelled).await?;
                return Ok(build);
            }
            if self.farm.store.mark_cancelling(build_id).await? {
                info!(build_id = %build_id, "Build marked for cancellation");
                return Ok(self.farm.store.get_build(build_id).await?);
            }
            // Claimed or released between the two steps.
            debug!(build_id = %build_id, "Build changed state while cancelling");
        }
        Err(Error::Conflict(format!(
            "build {} kept changing state while cancelling",
            build_id
        )))
    }

    /// Put a failed build back in the queue.
    pub async fn retry_build(&self, build_id: BuildId) -> Result<Job> {
        let mut build = self.farm.store.get_build(build_id).await?;
        if !build.can_be_retried() {
            return Err(Error::Conflict(format!(
                "build {} is {} and cannot be retried",
                build.id, build.status
            )));
        }
        build.reset_for_retry();
        self.farm.store.save_build(&build).await?;

        let score = self.farm.behaviors.for_build(&build).score(&build.spec);
        let job = self.farm.store.requeue(build_id, score).await?;
        info!(build_id = %build.id, job_id = %job.id, score, "Build retried");
        Ok(job)
    }
}
