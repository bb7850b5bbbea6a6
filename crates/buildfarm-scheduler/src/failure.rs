//! Failure counting and backoff.
//!
//! A failed build attempt is pinned on whichever of the worker and the build
//! has failed more often. Failures pinned on a worker accumulate; every
//! `reset_threshold` of them a virtualized worker gets its VM reset and a
//! native worker is taken out of service. A virtualized worker is disabled
//! once its resets keep failing, or once it reaches the total cap although
//! its resets succeed.

use buildfarm_core::build::BuildStatus;
use buildfarm_core::transport::WorkerTransport;
use buildfarm_core::worker::Worker;
use buildfarm_core::{BuildId, JobId, Result, WorkerId};
use std::cmp::Ordering;
use tracing::{error, info, warn};

use crate::farm::Farm;
use crate::lifecycle::complete;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Consecutive failures between reset actions.
    pub reset_threshold: u32,
    /// Consecutive failed reset actions before the worker is disabled.
    pub reset_failure_threshold: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            reset_threshold: 5,
            reset_failure_threshold: 3,
        }
    }
}

/// What the policy wants done with a worker after a failure was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Tolerate,
    Reset,
    Disable,
    AlreadyDisabled,
}

impl FailurePolicy {
    pub fn total_cap(&self) -> u32 {
        self.reset_threshold
            .saturating_mul(self.reset_failure_threshold)
    }

    pub fn assess(&self, worker: &Worker) -> Assessment {
        if !worker.ok {
            return Assessment::AlreadyDisabled;
        }
        let count = worker.failure_count;
        if count == 0 || self.reset_threshold == 0 || count % self.reset_threshold != 0 {
            return Assessment::Tolerate;
        }
        if !worker.virtualized {
            return Assessment::Disable;
        }
        // Failed resets disable through the reset tier; the cap only catches
        // workers whose resets succeed without helping.
        if count >= self.total_cap() && worker.reset_failure_count == 0 {
            return Assessment::Disable;
        }
        Assessment::Reset
    }
}

/// Outcome of `record_worker_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Counted,
    Reset,
    ResetFailed,
    Disabled,
    AlreadyDisabled,
}

/// Who a failed build attempt was pinned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blame {
    /// Both have failed equally often. The build goes back to the queue and
    /// nothing is escalated.
    Undecided,
    /// The worker has failed more. The build goes back to the queue.
    Worker(FailureAction),
    /// The build has failed more than this worker has. It fails for good and
    /// the worker's slate is wiped.
    Build,
}

/// Count a failure against a worker and escalate as the policy says.
pub async fn record_worker_failure(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker_id: WorkerId,
    reason: &str,
) -> Result<FailureAction> {
    let worker = farm.store.add_worker_failure(worker_id).await?;
    warn!(
        worker = %worker.name,
        failure_count = worker.failure_count,
        reason,
        "Worker failure"
    );
    escalate(farm, transport, &worker, reason).await
}

/// A claimed build could not be carried through on `worker_id`. Count the
/// failure against both and decide which one is broken.
pub async fn record_attempt_failure(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker_id: WorkerId,
    job_id: JobId,
    build_id: BuildId,
    reason: &str,
) -> Result<Blame> {
    let worker = farm.store.add_worker_failure(worker_id).await?;
    let build_failures = farm.store.add_build_failure(build_id).await?;
    warn!(
        worker = %worker.name,
        %build_id,
        worker_failures = worker.failure_count,
        build_failures,
        reason,
        "Build attempt failed"
    );

    match worker.failure_count.cmp(&build_failures) {
        Ordering::Equal => {
            farm.store.release(job_id).await?;
            Ok(Blame::Undecided)
        }
        Ordering::Greater => {
            farm.store.release(job_id).await?;
            let action = escalate(farm, transport, &worker, reason).await?;
            Ok(Blame::Worker(action))
        }
        Ordering::Less => {
            error!(
                %build_id,
                build_failures,
                reason,
                "Build keeps failing on healthy workers, failing it"
            );
            farm.store.clear_worker_failures(worker_id).await?;
            let mut build = farm.store.get_build(build_id).await?;
            complete(farm, job_id, &mut build, BuildStatus::FailedToBuild).await?;
            Ok(Blame::Build)
        }
    }
}

async fn escalate(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    reason: &str,
) -> Result<FailureAction> {
    let policy = farm.settings.failure_policy;
    match policy.assess(worker) {
        Assessment::Tolerate => Ok(FailureAction::Counted),
        Assessment::AlreadyDisabled => Ok(FailureAction::AlreadyDisabled),
        Assessment::Disable => disable(farm, worker.id, reason).await,
        Assessment::Reset => {
            info!(worker = %worker.name, "Resetting worker after repeated failures");
            match transport.resume().await {
                Ok(()) => {
                    farm.store.record_reset(worker.id, true).await?;
                    Ok(FailureAction::Reset)
                }
                Err(e) => {
                    let worker = farm.store.record_reset(worker.id, false).await?;
                    warn!(
                        worker = %worker.name,
                        reset_failure_count = worker.reset_failure_count,
                        error = %e,
                        "Worker reset failed"
                    );
                    if worker.reset_failure_count >= policy.reset_failure_threshold {
                        disable(farm, worker.id, &format!("reset failed: {}", e)).await
                    } else {
                        Ok(FailureAction::ResetFailed)
                    }
                }
            }
        }
    }
}

async fn disable(farm: &Farm, worker_id: WorkerId, reason: &str) -> Result<FailureAction> {
    let Some(worker) = farm.store.disable_worker(worker_id, reason).await? else {
        return Ok(FailureAction::AlreadyDisabled);
    };
    error!(
        worker = %worker.name,
        failure_count = worker.failure_count,
        reason,
        "Disabling worker"
    );
    if let Err(e) = farm.notifier.worker_disabled(&worker, reason).await {
        warn!(worker = %worker.name, error = %e, "Failed to notify operators");
    }
    Ok(FailureAction::Disabled)
}

/// A build finished cleanly, so the worker is healthy again.
pub async fn record_worker_success(farm: &Farm, worker_id: WorkerId) -> Result<()> {
    farm.store.clear_worker_failures(worker_id).await?;
    Ok(())
}
