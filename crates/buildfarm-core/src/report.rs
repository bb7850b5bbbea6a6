//! Status reports sent by workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// What the worker's build daemon is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Building,
    Aborting,
    Aborted,
    /// The build finished and the worker waits for its results to be collected.
    Waiting,
}

/// Outcome of a finished build, reported while the worker is WAITING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildOutcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "PACKAGEFAIL")]
    PackageFail,
    #[serde(rename = "DEPFAIL")]
    DepFail,
    #[serde(rename = "CHROOTFAIL")]
    ChrootFail,
    #[serde(rename = "BUILDERFAIL")]
    BuilderFail,
    #[serde(rename = "GIVENBACK")]
    GivenBack,
    #[serde(rename = "ABORTED")]
    Aborted,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOutcome::Ok => "OK",
            BuildOutcome::PackageFail => "PACKAGEFAIL",
            BuildOutcome::DepFail => "DEPFAIL",
            BuildOutcome::ChrootFail => "CHROOTFAIL",
            BuildOutcome::BuilderFail => "BUILDERFAIL",
            BuildOutcome::GivenBack => "GIVENBACK",
            BuildOutcome::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker's view of its current build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub builder_status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildOutcome>,
    /// Cookie of the build the worker believes it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logtail: Option<String>,
    /// Produced files, logical name to content hash.
    #[serde(default)]
    pub filemap: BTreeMap<String, String>,
    /// Content hash of the build log, if one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_log: Option<String>,
    /// Unsatisfied dependencies, for DEPFAIL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<String>,
}

impl StatusReport {
    pub fn idle() -> Self {
        Self {
            builder_status: WorkerStatus::Idle,
            build_status: None,
            build_id: None,
            logtail: None,
            filemap: BTreeMap::new(),
            build_log: None,
            dependencies: None,
        }
    }

    pub fn building(cookie: impl Into<String>) -> Self {
        Self {
            builder_status: WorkerStatus::Building,
            build_id: Some(cookie.into()),
            ..Self::idle()
        }
    }

    pub fn waiting(cookie: impl Into<String>, outcome: BuildOutcome) -> Self {
        Self {
            builder_status: WorkerStatus::Waiting,
            build_status: Some(outcome),
            build_id: Some(cookie.into()),
            ..Self::idle()
        }
    }

    pub fn aborted(cookie: impl Into<String>) -> Self {
        Self {
            builder_status: WorkerStatus::Aborted,
            build_id: Some(cookie.into()),
            ..Self::idle()
        }
    }

    /// Reject reports that cannot be interpreted.
    pub fn validate(&self) -> Result<()> {
        if self.builder_status != WorkerStatus::Idle && self.build_id.is_none() {
            return Err(Error::Protocol(format!(
                "{:?} report without a build cookie",
                self.builder_status
            )));
        }
        if self.builder_status == WorkerStatus::Waiting && self.build_status.is_none() {
            return Err(Error::Protocol(
                "WAITING report without a build status".to_string(),
            ));
        }
        Ok(())
    }

    /// Outcome of the build as far as the lifecycle is concerned.
    ///
    /// An ABORTED worker status reads as an ABORTED outcome.
    pub fn outcome(&self) -> Option<BuildOutcome> {
        match self.builder_status {
            WorkerStatus::Waiting => self.build_status,
            WorkerStatus::Aborted => Some(BuildOutcome::Aborted),
            _ => None,
        }
    }
}
