//! Picking the next job for an idle worker.

use buildfarm_core::Result;
use buildfarm_core::job::{Candidate, JobType};
use buildfarm_core::worker::Worker;
use std::collections::HashMap;
use tracing::{Instrument, debug, info};

use crate::behavior::{CandidateFilter, guard};
use crate::farm::{Farm, ScanContext};

/// Per-type refinement of the candidate list.
enum Refinement {
    AdmitAll,
    Filter(CandidateFilter),
    /// The type's filter hook panicked; none of its candidates are offered.
    RejectAll,
}

impl Refinement {
    fn admits(&self, job_type: JobType, candidate: &Candidate) -> bool {
        match self {
            Refinement::AdmitAll => true,
            Refinement::RejectAll => false,
            Refinement::Filter(filter) => {
                guard(job_type, "refine_candidates", || filter(candidate)).unwrap_or(false)
            }
        }
    }
}

fn refinements(farm: &Farm, worker: &Worker) -> HashMap<JobType, Refinement> {
    JobType::ALL
        .into_iter()
        .map(|job_type| {
            let behavior = farm.behaviors.get(job_type);
            let refinement = match guard(job_type, "refine_candidates", || {
                behavior.refine_candidates(&worker.processor, worker.virtualized)
            }) {
                Some(Some(filter)) => Refinement::Filter(filter),
                Some(None) => Refinement::AdmitAll,
                None => Refinement::RejectAll,
            };
            (job_type, refinement)
        })
        .collect()
}

/// Find the best compatible job for `worker` and claim it.
///
/// Candidates are tried in queue order. A candidate another scanner claimed
/// first is skipped. Returns `None` when nothing could be claimed.
pub async fn acquire_candidate(
    farm: &Farm,
    worker: &Worker,
    ctx: &ScanContext,
) -> Result<Option<Candidate>> {
    select(farm, worker).instrument(ctx.span().clone()).await
}

async fn select(farm: &Farm, worker: &Worker) -> Result<Option<Candidate>> {
    if !worker.is_schedulable() {
        return Ok(None);
    }

    let candidates = farm.store.candidates(worker).await?;
    if candidates.is_empty() {
        debug!("No candidates");
        return Ok(None);
    }

    let refinements = refinements(farm, worker);
    for candidate in candidates {
        let job_type = candidate.job.job_type;
        let admitted = refinements
            .get(&job_type)
            .is_some_and(|r| r.admits(job_type, &candidate));
        if !admitted {
            continue;
        }

        let behavior = farm.behaviors.get(job_type);
        let approved = guard(job_type, "post_selection_approve", || {
            behavior.post_selection_approve(&candidate, worker)
        })
        .unwrap_or(false);
        if !approved {
            debug!(job_id = %candidate.job.id, "Candidate not approved");
            continue;
        }

        match farm.store.try_claim(candidate.job.id, worker.id).await? {
            Some(claimed) => {
                info!(
                    job_id = %claimed.job.id,
                    build_id = %claimed.build.id,
                    score = claimed.job.score,
                    "Claimed job"
                );
                return Ok(Some(claimed));
            }
            None => {
                debug!(job_id = %candidate.job.id, "Job claimed by another worker");
            }
        }
    }
    Ok(None)
}
