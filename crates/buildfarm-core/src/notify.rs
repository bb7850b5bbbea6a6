//! Notification of build requesters and operators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::{Build, BuildStatus};
use crate::worker::Worker;
use crate::{BuildId, Result};

/// Build statuses that trigger a notification to the requester.
///
/// FULLYBUILT is announced by the upload processor, not by us.
pub const NOTIFY_STATUSES: [BuildStatus; 4] = [
    BuildStatus::ManualDepWait,
    BuildStatus::ChrootWait,
    BuildStatus::FailedToBuild,
    BuildStatus::Cancelled,
];

pub fn should_notify(status: BuildStatus) -> bool {
    NOTIFY_STATUSES.contains(&status)
}

/// Payload describing a build status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNotification {
    pub build_id: BuildId,
    pub title: String,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

impl BuildNotification {
    pub fn new(build: &Build) -> Self {
        Self {
            build_id: build.id,
            title: build.title(),
            status: build.status,
            dependencies: build.dependencies.clone(),
            log_url: build.log.as_ref().map(|l| l.location.clone()),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the requester about a build status change.
    async fn notify(&self, notification: &BuildNotification) -> Result<()>;

    /// Tell operators a worker was taken out of service.
    async fn worker_disabled(&self, worker: &Worker, reason: &str) -> Result<()>;
}
