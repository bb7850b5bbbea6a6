//! Queue entries and the worker compatibility rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::build::Build;
use crate::worker::Worker;
use crate::{BuildId, JobId, WorkerId};

/// Kind of work a job represents. Each kind has one behaviour implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    PackageBuild,
    TranslationTemplatesBuild,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::PackageBuild, JobType::TranslationTemplatesBuild];

    /// Name used in build cookies and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PackageBuild => "PACKAGEBUILD",
            JobType::TranslationTemplatesBuild => "TRANSLATIONTEMPLATESBUILD",
        }
    }

    /// Builder type understood by the worker's build daemon.
    pub fn builder_type(&self) -> &'static str {
        match self {
            JobType::PackageBuild => "binarypackage",
            JobType::TranslationTemplatesBuild => "translation-templates",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("unknown job type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Suspended => "suspended",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "suspended" => Ok(JobStatus::Suspended),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// A schedulable queue entry wrapping exactly one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub job_type: JobType,
    /// Required processor, `None` for processor-independent work.
    pub processor: Option<String>,
    /// Required virtualization, `None` when the job expressed no preference.
    pub virtualized: Option<bool>,
    pub score: i32,
    /// Set when an operator rescored the job by hand.
    pub manual_score: bool,
    pub status: JobStatus,
    pub claimed_by: Option<WorkerId>,
    pub requesting_principal: Option<String>,
    pub logtail: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Waiting && self.claimed_by.is_none()
    }
}

/// Whether `job` may run on `worker`.
///
/// A native worker only accepts jobs that explicitly declared themselves safe
/// for native execution. Jobs without a virtualization preference go to
/// virtualized workers only.
pub fn is_compatible(worker: &Worker, job: &Job) -> bool {
    let processor_ok = match &job.processor {
        None => true,
        Some(p) => *p == worker.processor,
    };
    let virtualization_ok = match job.virtualized {
        Some(v) => v == worker.virtualized,
        None => worker.virtualized,
    };
    processor_ok && virtualization_ok
}

/// Queue order: highest score first, oldest job first on ties.
pub fn queue_order(a: &Job, b: &Job) -> Ordering {
    b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id))
}

/// A job eligible for a specific worker, together with the build it wraps.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub job: Job,
    pub build: Build,
}

#[cfg(test)]
pub(crate) fn sample_job(id: i64, virtualized: Option<bool>, score: i32) -> Job {
    Job {
        id: JobId::new(id),
        build_id: BuildId::new(id),
        job_type: JobType::PackageBuild,
        processor: Some("386".to_string()),
        virtualized,
        score,
        manual_score: false,
        status: JobStatus::Waiting,
        claimed_by: None,
        requesting_principal: None,
        logtail: None,
        date_created: Utc::now(),
        date_started: None,
    }
}
