//! Starting a claimed build on a worker.

use buildfarm_core::build::{Build, BuildStatus, FileRef};
use buildfarm_core::dispatch::{Credentials, DispatchOutcome, DispatchRequest};
use buildfarm_core::job::Candidate;
use buildfarm_core::report::WorkerStatus;
use buildfarm_core::transport::WorkerTransport;
use buildfarm_core::worker::Worker;
use buildfarm_core::{Error, Result};
use std::collections::BTreeMap;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::behavior::BuildBehavior;
use crate::failure::record_attempt_failure;
use crate::farm::{Farm, ScanContext};
use crate::lifecycle::complete;

/// Dispatch a claimed candidate to `worker`.
///
/// On failure the claim is settled before this returns. A build that can
/// never run is failed outright. Faults while talking to the worker count
/// against both the worker and the build, and whichever has failed more
/// takes the blame. Anything else puts the job back in the queue.
pub async fn dispatch(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    candidate: &Candidate,
    ctx: &ScanContext,
) -> Result<DispatchOutcome> {
    let behavior = farm.behaviors.for_build(&candidate.build);
    let cookie = behavior.build_cookie(&candidate.build);
    let span = ctx.dispatch(&cookie).span().clone();

    let result = start(farm, transport, worker, &candidate.build, behavior, &cookie)
        .instrument(span.clone())
        .await;

    let err = match result {
        Ok(outcome) => return Ok(outcome),
        Err(e) => e,
    };

    async {
        warn!(job_id = %candidate.job.id, error = %err, "Dispatch failed");
        if let Error::BuildRejected(_) = err {
            let mut build = farm.store.get_build(candidate.build.id).await?;
            complete(farm, candidate.job.id, &mut build, BuildStatus::FailedToBuild).await?;
        } else if err.is_worker_fault() {
            let blame = record_attempt_failure(
                farm,
                transport,
                worker.id,
                candidate.job.id,
                candidate.build.id,
                &err.to_string(),
            )
            .await?;
            debug!(?blame, "Dispatch failure assessed");
        } else {
            farm.store.release(candidate.job.id).await?;
        }
        Ok::<_, Error>(())
    }
    .instrument(span)
    .await?;

    Err(err)
}

async fn start(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    worker: &Worker,
    build: &Build,
    behavior: &dyn BuildBehavior,
    cookie: &str,
) -> Result<DispatchOutcome> {
    let attempt = Uuid::new_v4();
    behavior.verify_build_request(build, worker)?;

    if worker.virtualized {
        transport.resume().await?;
        let pong = transport.echo("ping").await?;
        if pong != "ping" {
            return Err(Error::Protocol(format!("echo answered {:?}", pong)));
        }
    }

    let chroot = build
        .spec
        .chroot()
        .ok_or_else(|| Error::BuildRejected(format!("missing chroot for {}", build.title())))?;
    transport
        .cache_file(&chroot.content_hash, &chroot.url, None)
        .await?;

    let inputs = behavior.input_files(build);
    for file in &inputs {
        stage(farm, transport, build, file, cookie).await?;
    }

    let filemap: BTreeMap<String, String> = inputs
        .iter()
        .map(|f| (f.filename.clone(), f.content_hash.clone()))
        .collect();
    let request = DispatchRequest {
        cookie: cookie.to_string(),
        builder_type: build.job_type().builder_type().to_string(),
        chroot_hash: chroot.content_hash.clone(),
        filemap,
        args: behavior.build_arguments(build)?,
    };

    info!(
        %attempt,
        cookie,
        worker = %worker.name,
        builder_type = %request.builder_type,
        files = request.filemap.len(),
        "Starting build"
    );
    let response = transport.start_build(&request).await?;
    info!(
        %attempt,
        cookie,
        worker = %worker.name,
        status = ?response.status,
        info = %response.info,
        "Worker answered build request"
    );

    if response.status != WorkerStatus::Building {
        return Err(Error::CannotBuild(format!(
            "worker {} answered {:?}: {}",
            worker.name, response.status, response.info
        )));
    }

    Ok(DispatchOutcome {
        cookie: cookie.to_string(),
        info: response.info,
        staged_files: inputs.len() + 1,
    })
}

/// Ask the worker to cache one input. Private inputs go through a signed URL
/// so the worker fetches them straight from the file server.
async fn stage(
    farm: &Farm,
    transport: &dyn WorkerTransport,
    build: &Build,
    file: &FileRef,
    cookie: &str,
) -> Result<()> {
    if !build.spec.is_private() {
        debug!(file = %file.filename, "Staging public file");
        return transport.cache_file(&file.content_hash, &file.url, None).await;
    }

    let signer = farm.settings.private_files.as_ref().ok_or_else(|| {
        Error::Internal("private build but no private file server configured".to_string())
    })?;
    let credentials = Credentials {
        username: cookie.to_string(),
        password: signer.token(&file.content_hash),
    };
    debug!(file = %file.filename, "Staging private file");
    transport
        .cache_file(
            &file.content_hash,
            &signer.url_for(&file.content_hash, &file.filename),
            Some(&credentials),
        )
        .await
}
