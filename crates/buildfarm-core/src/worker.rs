//! Build workers.

use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// A physical or virtual build agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Unique name, e.g. "bob" or "lamb-07".
    pub name: String,
    /// Base URL of the worker's RPC endpoint and file cache.
    pub url: String,
    /// Processor tag the worker can build for (e.g. "amd64", "386").
    pub processor: String,
    /// Whether the worker runs builds inside a disposable VM.
    pub virtualized: bool,
    /// Host that owns the VM, used by the reset action.
    pub vm_host: Option<String>,
    /// Health flag. A worker with `ok = false` is never offered work.
    pub ok: bool,
    /// Consecutive failures attributed to this worker.
    pub failure_count: u32,
    /// Consecutive reset actions that failed.
    pub reset_failure_count: u32,
    /// Manual workers are excluded from automatic scheduling.
    pub manual: bool,
    pub active: bool,
    /// Why the worker was last disabled.
    pub fail_notes: Option<String>,
}

impl Worker {
    /// Whether the scheduler may hand this worker a new job at all.
    pub fn is_schedulable(&self) -> bool {
        self.ok && self.active && !self.manual
    }

    /// Mark the worker as failed. Returns false if it was already disabled.
    pub fn disable(&mut self, reason: impl Into<String>) -> bool {
        self.fail_notes = Some(reason.into());
        if !self.ok {
            return false;
        }
        self.ok = false;
        true
    }

    /// Put the worker back into service.
    pub fn enable(&mut self) {
        if !self.ok {
            self.failure_count = 0;
            self.reset_failure_count = 0;
        }
        self.ok = true;
    }

    pub fn reset_failure_counts(&mut self) {
        self.failure_count = 0;
        self.reset_failure_count = 0;
    }
}

/// Fields an operator supplies when registering a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorker {
    pub name: String,
    pub url: String,
    pub processor: String,
    pub virtualized: bool,
    pub vm_host: Option<String>,
    pub manual: bool,
    pub active: bool,
}

#[cfg(test)]
pub(crate) fn sample_worker(virtualized: bool) -> Worker {
    Worker {
        id: WorkerId::new(1),
        name: "bob".to_string(),
        url: "http://bob:8221".to_string(),
        processor: "386".to_string(),
        virtualized,
        vm_host: virtualized.then(|| "host1".to_string()),
        ok: true,
        failure_count: 0,
        reset_failure_count: 0,
        manual: false,
        active: true,
        fail_notes: None,
    }
}
