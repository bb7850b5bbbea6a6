//! Farm manager: one scanner task per worker.

use buildfarm_core::report::StatusReport;
use buildfarm_core::transport::TransportFactory;
use buildfarm_core::{Error, Result, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::farm::Farm;
use crate::scanner::WorkerScanner;

const REPORT_QUEUE_DEPTH: usize = 32;

/// Routes reports pushed through the API to the worker's scanner.
#[derive(Clone, Default)]
pub struct ReportRouter {
    senders: Arc<RwLock<HashMap<String, mpsc::Sender<StatusReport>>>>,
}

impl ReportRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, worker: &str, sender: mpsc::Sender<StatusReport>) {
        self.senders.write().await.insert(worker.to_string(), sender);
    }

    async fn unregister(&self, worker: &str) {
        self.senders.write().await.remove(worker);
    }

    /// Hand a report to the scanner of `worker`.
    pub async fn push(&self, worker: &str, report: StatusReport) -> Result<()> {
        let sender = self
            .senders
            .read()
            .await
            .get(worker)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no scanner for worker {}", worker)))?;
        sender
            .send(report)
            .await
            .map_err(|_| Error::Internal(format!("scanner for {} has stopped", worker)))
    }
}

/// Spawns scanners for workers as they appear.
pub struct FarmManager {
    farm: Arc<Farm>,
    transports: Arc<dyn TransportFactory>,
    router: ReportRouter,
}

/// Running manager.
pub struct ManagerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ManagerHandle {
    /// Stop the manager and every scanner, then wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "Farm manager task failed");
        }
    }
}

impl FarmManager {
    pub fn new(farm: Arc<Farm>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            farm,
            transports,
            router: ReportRouter::new(),
        }
    }

    pub fn router(&self) -> ReportRouter {
        self.router.clone()
    }

    pub fn start(self) -> ManagerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        ManagerHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting farm manager");
        let mut scanners = JoinSet::new();
        let mut running: HashMap<WorkerId, String> = HashMap::new();
        let mut tasks: HashMap<tokio::task::Id, WorkerId> = HashMap::new();
        let mut tick = tokio::time::interval(self.farm.settings.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self
                        .spawn_new_scanners(&mut scanners, &mut running, &mut tasks, &shutdown)
                        .await
                    {
                        warn!(error = %e, "Failed to look for new workers");
                    }
                }
                Some(joined) = scanners.join_next_with_id() => {
                    let task = match &joined {
                        Ok((id, ())) => *id,
                        Err(e) => {
                            error!(error = %e, "Scanner task failed");
                            e.id()
                        }
                    };
                    // Forget the worker so the next tick starts a fresh scanner.
                    if let Some(worker_id) = tasks.remove(&task) {
                        if let Some(name) = running.remove(&worker_id) {
                            self.router.unregister(&name).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(scanners = scanners.len(), "Stopping farm manager");
        while scanners.join_next().await.is_some() {}
    }

    async fn spawn_new_scanners(
        &self,
        scanners: &mut JoinSet<()>,
        running: &mut HashMap<WorkerId, String>,
        tasks: &mut HashMap<tokio::task::Id, WorkerId>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let workers = self.farm.store.list_workers().await?;
        for worker in workers {
            if !worker.active || running.contains_key(&worker.id) {
                continue;
            }
            let (sender, reports) = mpsc::channel(REPORT_QUEUE_DEPTH);
            self.router.register(&worker.name, sender).await;

            let scanner = WorkerScanner::new(
                self.farm.clone(),
                worker.id,
                self.transports.connect(&worker),
                reports,
                shutdown.clone(),
            );
            let handle = scanners.spawn(scanner.run());
            tasks.insert(handle.id(), worker.id);
            running.insert(worker.id, worker.name.clone());
            info!(worker = %worker.name, "Scanner started");
        }
        Ok(())
    }
}
