//! Build lifecycle driven by worker status reports.
//!
//! A report is matched against the job the worker holds a claim on. Only a
//! report carrying that job's cookie may change anything; everything else is
//! logged and dropped.

use buildfarm_core::artifact::{ArtifactRef, Upload, content_hash};
use buildfarm_core::build::{Build, BuildStatus};
use buildfarm_core::job::{Candidate, JobStatus};
use buildfarm_core::notify::{BuildNotification, should_notify};
use buildfarm_core::report::{BuildOutcome, StatusReport, WorkerStatus};
use buildfarm_core::transport::WorkerTransport;
use buildfarm_core::worker::Worker;
use buildfarm_core::{BuildId, Error, JobId, Result};
use chrono::Utc;
use tracing::{Instrument, debug, info, warn};

use crate::behavior::BuildBehavior;
use crate::failure::{Blame, record_attempt_failure, record_worker_success};
use crate::farm::{Farm, ScanContext};

const ABORTING_LOGTAIL: &str = "Waiting for worker process to be terminated";

/// What a status report did to the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Stale or malformed, nothing changed.
    Discarded,
    InProgress,
    Finished(BuildStatus),
    /// The build went back to the queue.
    Requeued,
}

/// Apply a report from `worker` to the build it holds.
pub async fn handle_status(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    candidate: &Candidate,
    report: &StatusReport,
    ctx: &ScanContext,
) -> Result<Handled> {
    apply(farm, transport, worker, candidate, report)
        .instrument(ctx.span().clone())
        .await
}

async fn apply(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    candidate: &Candidate,
    report: &StatusReport,
) -> Result<Handled> {
    if let Err(e) = report.validate() {
        warn!(error = %e, "Discarding malformed status report");
        return Ok(Handled::Discarded);
    }

    let behavior = farm.behaviors.for_build(&candidate.build);
    let cookie = behavior.build_cookie(&candidate.build);
    if report.build_id.as_deref() != Some(cookie.as_str()) {
        warn!(
            expected = %cookie,
            reported = ?report.build_id,
            "Discarding status report for another build"
        );
        return Ok(Handled::Discarded);
    }

    // Re-read: an operator may have cancelled since the claim was loaded.
    let mut build = farm.store.get_build(candidate.build.id).await?;
    let cancelling = match build.status {
        BuildStatus::Building | BuildStatus::Uploading => false,
        BuildStatus::Cancelling => true,
        other => {
            warn!(cookie = %cookie, status = %other, "Report for a build that is not running");
            return Ok(Handled::Discarded);
        }
    };

    let outcome = match report.builder_status {
        WorkerStatus::Building => {
            update_logtail(farm, candidate.job.id, report.logtail.clone()).await?;
            return Ok(Handled::InProgress);
        }
        WorkerStatus::Aborting => {
            update_logtail(farm, candidate.job.id, Some(ABORTING_LOGTAIL.to_string())).await?;
            return Ok(Handled::InProgress);
        }
        WorkerStatus::Idle => return Ok(Handled::Discarded),
        WorkerStatus::Waiting | WorkerStatus::Aborted => match report.outcome() {
            Some(outcome) => outcome,
            None => return Ok(Handled::Discarded),
        },
    };

    info!(cookie = %cookie, worker = %worker.name, %outcome, "Build reported an outcome");
    let job_id = candidate.job.id;
    match outcome {
        BuildOutcome::Aborted if cancelling => {
            finish(farm, transport, job_id, &mut build, report, &cookie, BuildStatus::Cancelled)
                .await
        }
        BuildOutcome::Ok => {
            build.status = BuildStatus::Uploading;
            farm.store.save_build(&build).await?;
            let status = match collect_results(farm, transport, behavior, &build, report).await {
                Ok(files) => {
                    build.files = files;
                    BuildStatus::FullyBuilt
                }
                Err(e) => {
                    warn!(cookie = %cookie, error = %e, "Collecting build results failed");
                    BuildStatus::FailedToUpload
                }
            };
            let handled =
                finish(farm, transport, job_id, &mut build, report, &cookie, status).await?;
            if status == BuildStatus::FullyBuilt {
                record_worker_success(farm, worker.id).await?;
            }
            Ok(handled)
        }
        BuildOutcome::DepFail => {
            build.dependencies = report.dependencies.clone();
            if behavior.depwait_counts_as_failure() {
                build.failure_count += 1;
            }
            finish(farm, transport, job_id, &mut build, report, &cookie, BuildStatus::ManualDepWait)
                .await
        }
        BuildOutcome::ChrootFail => {
            build.failure_count += 1;
            finish(farm, transport, job_id, &mut build, report, &cookie, BuildStatus::ChrootWait)
                .await
        }
        BuildOutcome::PackageFail => {
            build.failure_count += 1;
            finish(farm, transport, job_id, &mut build, report, &cookie, BuildStatus::FailedToBuild)
                .await
        }
        BuildOutcome::Aborted | BuildOutcome::BuilderFail => {
            let reason = format!("build {} ended with {}", cookie, outcome);
            lost_build(farm, transport, worker, job_id, build.id, &reason).await
        }
        BuildOutcome::GivenBack => {
            info!(cookie = %cookie, "Worker gave the build back");
            clean_quietly(transport).await;
            farm.store.release(job_id).await?;
            Ok(Handled::Requeued)
        }
    }
}

async fn update_logtail(farm: &Farm, job_id: JobId, logtail: Option<String>) -> Result<()> {
    let mut job = farm.store.get_job(job_id).await?;
    if job.logtail != logtail {
        job.logtail = logtail;
        farm.store.save_job(&job).await?;
    }
    Ok(())
}

/// Fetch every produced file from the worker and store it.
async fn collect_results(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    behavior: &dyn BuildBehavior,
    build: &Build,
    report: &StatusReport,
) -> Result<Vec<ArtifactRef>> {
    let restricted = build.spec.is_private();
    let mut files = Vec::with_capacity(report.filemap.len());
    for (name, hash) in &report.filemap {
        let data = transport.get_file(hash).await?;
        let actual = content_hash(&data);
        if actual != *hash {
            return Err(Error::Upload(format!(
                "{} has hash {}, worker said {}",
                name, actual, hash
            )));
        }
        debug!(file = %name, size = data.len(), "Uploading build result");
        let artifact = farm
            .librarian
            .upload(Upload::new(name.clone(), data).restricted(restricted))
            .await?;
        files.push(artifact);
    }
    behavior.verify_upload(build, &files)?;
    Ok(files)
}

/// Terminal transition shared by every finished build.
async fn finish(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    job_id: JobId,
    build: &mut Build,
    report: &StatusReport,
    cookie: &str,
    status: BuildStatus,
) -> Result<Handled> {
    if let Some(hash) = &report.build_log {
        match fetch_log(farm, transport, build, hash, cookie).await {
            Ok(log) => build.log = Some(log),
            Err(e) => warn!(cookie, error = %e, "Failed to store build log"),
        }
    }
    complete(farm, job_id, build, status).await?;
    clean_quietly(transport).await;
    Ok(Handled::Finished(status))
}

async fn fetch_log(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    build: &Build,
    hash: &str,
    cookie: &str,
) -> Result<ArtifactRef> {
    let data = transport.get_file(hash).await?;
    farm.librarian
        .upload(
            Upload::new(format!("buildlog_{}.txt.gz", cookie), data)
                .restricted(build.spec.is_private()),
        )
        .await
}

/// Give the build its final status, close the job and tell the requester.
pub(crate) async fn complete(
    farm: &Farm,
    job_id: JobId,
    build: &mut Build,
    status: BuildStatus,
) -> Result<()> {
    build.status = status;
    build.date_finished = Some(Utc::now());
    farm.store.save_build(build).await?;

    let job_status = if status == BuildStatus::FullyBuilt {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    farm.store.finish(job_id, job_status).await?;
    info!(build_id = %build.id, %status, "Build finished");

    if should_notify(status) {
        if let Err(e) = farm.notifier.notify(&BuildNotification::new(build)).await {
            warn!(build_id = %build.id, error = %e, "Failed to notify requester");
        }
    }
    Ok(())
}

/// The worker lost the build. Blame it or the build, whichever has failed
/// more, and either requeue the build or fail it.
pub(crate) async fn lost_build(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    job_id: JobId,
    build_id: BuildId,
    reason: &str,
) -> Result<Handled> {
    warn!(worker = %worker.name, %build_id, reason, "Worker lost build");
    clean_quietly(transport).await;
    match record_attempt_failure(farm, transport, worker.id, job_id, build_id, reason).await? {
        Blame::Build => Ok(Handled::Finished(BuildStatus::FailedToBuild)),
        Blame::Undecided | Blame::Worker(_) => Ok(Handled::Requeued),
    }
}

pub(crate) async fn clean_quietly(transport: &dyn WorkerTransport) {
    if let Err(e) = transport.clean().await {
        warn!(error = %e, "Failed to clean worker");
    }
}
