//! Job-type specific behaviour.
//!
//! The scheduler itself knows nothing about what a build produces. Everything
//! that differs between job types (candidate filtering, build arguments,
//! scoring, upload checks) lives behind `BuildBehavior`.

mod binary;
mod translation;

pub use binary::BinaryPackageBehavior;
pub use translation::TranslationTemplatesBehavior;

use buildfarm_core::Result;
use buildfarm_core::artifact::ArtifactRef;
use buildfarm_core::build::{Build, BuildSpec, FileRef};
use buildfarm_core::dispatch::build_cookie;
use buildfarm_core::job::{Candidate, JobType};
use buildfarm_core::worker::Worker;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::error;

/// Extra filter a job type applies to the ranked candidate list.
pub type CandidateFilter = Box<dyn Fn(&Candidate) -> bool + Send + Sync>;

pub trait BuildBehavior: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Filter to apply to candidates of this type for a worker with the
    /// given capabilities. `None` lets every candidate through.
    fn refine_candidates(&self, _processor: &str, _virtualized: bool) -> Option<CandidateFilter> {
        None
    }

    /// Last check before a candidate is claimed.
    fn post_selection_approve(&self, _candidate: &Candidate, _worker: &Worker) -> bool {
        true
    }

    fn build_cookie(&self, build: &Build) -> String {
        build_cookie(self.job_type(), build.id)
    }

    /// Refuse builds that must not run on `worker` at all.
    fn verify_build_request(&self, build: &Build, worker: &Worker) -> Result<()>;

    fn build_arguments(&self, build: &Build) -> Result<serde_json::Map<String, serde_json::Value>>;

    /// Files the worker needs besides the chroot.
    fn input_files(&self, build: &Build) -> Vec<FileRef>;

    /// How long a worker may go without answering before the build is
    /// treated as lost.
    fn max_silence(&self) -> Duration;

    fn score(&self, spec: &BuildSpec) -> i32;

    fn depwait_counts_as_failure(&self) -> bool {
        false
    }

    /// Check the uploaded results before the build is marked FULLYBUILT.
    fn verify_upload(&self, build: &Build, files: &[ArtifactRef]) -> Result<()>;
}

/// One behaviour per job type, built at startup.
pub struct BehaviorRegistry {
    binary: Box<dyn BuildBehavior>,
    translation: Box<dyn BuildBehavior>,
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self {
            binary: Box::new(BinaryPackageBehavior),
            translation: Box::new(TranslationTemplatesBehavior),
        }
    }

    /// Replace the behaviour registered for `behavior.job_type()`.
    pub fn with_behavior(mut self, behavior: impl BuildBehavior + 'static) -> Self {
        let slot = match behavior.job_type() {
            JobType::PackageBuild => &mut self.binary,
            JobType::TranslationTemplatesBuild => &mut self.translation,
        };
        *slot = Box::new(behavior);
        self
    }

    pub fn get(&self, job_type: JobType) -> &dyn BuildBehavior {
        match job_type {
            JobType::PackageBuild => self.binary.as_ref(),
            JobType::TranslationTemplatesBuild => self.translation.as_ref(),
        }
    }

    pub fn for_build(&self, build: &Build) -> &dyn BuildBehavior {
        self.get(build.job_type())
    }
}

/// Run a hook, turning a panic into `None`.
pub(crate) fn guard<T>(job_type: JobType, hook: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            error!(%job_type, hook, "Job type hook panicked");
            None
        }
    }
}
