//! Shared scheduler state.

use buildfarm_config::ManagerConfig;
use buildfarm_core::artifact::Librarian;
use buildfarm_core::notify::Notifier;
use buildfarm_core::worker::Worker;
use buildfarm_db::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, info_span};

use crate::behavior::BehaviorRegistry;
use crate::failure::FailurePolicy;
use crate::signer::PrivateFileSigner;

/// Tunables shared by every scanner.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub scan_interval: Duration,
    pub cancel_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Signs URLs for restricted inputs. Without it private builds cannot be
    /// dispatched.
    pub private_files: Option<PrivateFileSigner>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        let private_files = match (&config.private_file_base, &config.private_file_secret) {
            (Some(base), Some(secret)) => Some(PrivateFileSigner::new(base, secret)),
            _ => None,
        };
        Self {
            scan_interval: config.scan_interval,
            cancel_timeout: config.cancel_timeout,
            failure_policy: FailurePolicy {
                reset_threshold: config.reset_threshold,
                reset_failure_threshold: config.reset_failure_threshold,
            },
            private_files,
        }
    }
}

/// Collaborators and settings every scheduler operation works against.
pub struct Farm {
    pub store: Arc<dyn JobStore>,
    pub behaviors: BehaviorRegistry,
    pub librarian: Arc<dyn Librarian>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: SchedulerSettings,
}

impl Farm {
    pub fn new(
        store: Arc<dyn JobStore>,
        librarian: Arc<dyn Librarian>,
        notifier: Arc<dyn Notifier>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            behaviors: BehaviorRegistry::new(),
            librarian,
            notifier,
            settings,
        }
    }
}

/// Tracing scope of one scan cycle. Operations started from the cycle log
/// inside this span.
#[derive(Debug, Clone)]
pub struct ScanContext {
    span: Span,
}

impl ScanContext {
    pub fn for_worker(worker: &Worker) -> Self {
        Self {
            span: info_span!("scan", worker = %worker.name),
        }
    }

    /// Context for work not tied to a scan cycle, such as operator actions.
    pub fn detached(operation: &'static str) -> Self {
        Self {
            span: info_span!("farm", operation),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child scope for one dispatch attempt.
    pub fn dispatch(&self, cookie: &str) -> Self {
        Self {
            span: info_span!(parent: &self.span, "dispatch", cookie),
        }
    }
}
