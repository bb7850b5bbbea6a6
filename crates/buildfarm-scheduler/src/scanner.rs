//! Per-worker scan loop.

use buildfarm_core::build::BuildStatus;
use buildfarm_core::job::Candidate;
use buildfarm_core::report::{StatusReport, WorkerStatus};
use buildfarm_core::transport::WorkerTransport;
use buildfarm_core::worker::Worker;
use buildfarm_core::{Result, WorkerId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

use crate::dispatcher::dispatch;
use crate::failure::record_worker_failure;
use crate::farm::{Farm, ScanContext};
use crate::lifecycle::{Handled, clean_quietly, complete, handle_status, lost_build};
use crate::selector::acquire_candidate;

/// Drives one worker: follows its current build or finds it a new one.
pub struct WorkerScanner {
    farm: Arc<Farm>,
    worker_id: WorkerId,
    transport: Arc<dyn WorkerTransport>,
    reports: mpsc::Receiver<StatusReport>,
    shutdown: watch::Receiver<bool>,
    /// Last time the worker answered about its current build.
    last_contact: Instant,
    /// When the abort for a cancelled build was sent.
    cancel_requested_at: Option<Instant>,
}

impl WorkerScanner {
    pub fn new(
        farm: Arc<Farm>,
        worker_id: WorkerId,
        transport: Arc<dyn WorkerTransport>,
        reports: mpsc::Receiver<StatusReport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            farm,
            worker_id,
            transport,
            reports,
            shutdown,
            last_contact: Instant::now(),
            cancel_requested_at: None,
        }
    }

    /// Scan every `scan_interval` and handle pushed reports until shut down.
    pub async fn run(mut self) {
        info!(worker_id = %self.worker_id, "Starting scanner");
        let mut tick = tokio::time::interval(self.farm.settings.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!(worker_id = %self.worker_id, error = %e, "Scan failed");
                    }
                }
                Some(report) = self.reports.recv() => {
                    if let Err(e) = self.handle_pushed(report).await {
                        warn!(worker_id = %self.worker_id, error = %e, "Pushed report failed");
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "Scanner stopped");
    }

    /// One scan cycle.
    pub async fn scan_once(&mut self) -> Result<()> {
        let worker = self.farm.store.get_worker(self.worker_id).await?;
        let ctx = ScanContext::for_worker(&worker);
        let span = ctx.span().clone();
        self.scan(&worker, &ctx).instrument(span).await
    }

    async fn scan(&mut self, worker: &Worker, ctx: &ScanContext) -> Result<()> {
        let Some(candidate) = self.farm.store.current_job_for(worker.id).await? else {
            self.cancel_requested_at = None;
            return self.find_work(worker, ctx).await;
        };

        if !worker.ok || !worker.active {
            warn!(job_id = %candidate.job.id, "Worker out of service, releasing its job");
            self.farm.store.release(candidate.job.id).await?;
            return Ok(());
        }

        if candidate.build.status == BuildStatus::Cancelling {
            return self.follow_cancel(worker, candidate, ctx).await;
        }
        self.cancel_requested_at = None;
        self.follow_build(worker, &candidate, ctx).await
    }

    async fn follow_cancel(
        &mut self,
        worker: &Worker,
        candidate: Candidate,
        ctx: &ScanContext,
    ) -> Result<()> {
        let farm = &self.farm;
        match self.cancel_requested_at {
            None => {
                info!(build_id = %candidate.build.id, "Aborting cancelled build");
                if let Err(e) = self.transport.abort().await {
                    warn!(error = %e, "Abort request failed");
                }
                self.cancel_requested_at = Some(Instant::now());
            }
            Some(at) if at.elapsed() >= farm.settings.cancel_timeout => {
                warn!(
                    build_id = %candidate.build.id,
                    "Worker did not confirm cancellation in time"
                );
                record_worker_failure(
                    farm,
                    self.transport.as_ref(),
                    worker.id,
                    "cancellation timed out",
                )
                .await?;
                clean_quietly(self.transport.as_ref()).await;
                let mut build = farm.store.get_build(candidate.build.id).await?;
                complete(farm, candidate.job.id, &mut build, BuildStatus::Cancelled).await?;
                self.cancel_requested_at = None;
                return Ok(());
            }
            Some(_) => {}
        }
        self.follow_build(worker, &candidate, ctx).await
    }

    async fn follow_build(
        &mut self,
        worker: &Worker,
        candidate: &Candidate,
        ctx: &ScanContext,
    ) -> Result<()> {
        let farm = &self.farm;
        let behavior = farm.behaviors.for_build(&candidate.build);
        let cookie = behavior.build_cookie(&candidate.build);

        let report = match self.transport.poll_status().await {
            Ok(report) => report,
            Err(e) => {
                let silence = self.last_contact.elapsed();
                warn!(
                    cookie = %cookie,
                    error = %e,
                    silent_secs = silence.as_secs(),
                    "Polling worker failed"
                );
                if silence >= behavior.max_silence() {
                    let handled = lost_build(
                        farm,
                        self.transport.as_ref(),
                        worker,
                        candidate.job.id,
                        candidate.build.id,
                        &format!("no answer for {}s", silence.as_secs()),
                    )
                    .await?;
                    debug!(cookie = %cookie, ?handled, "Gave up on silent worker");
                    self.last_contact = Instant::now();
                }
                return Ok(());
            }
        };
        self.last_contact = Instant::now();

        if report.build_id.as_deref() != Some(cookie.as_str()) {
            warn!(
                expected = %cookie,
                reported = ?report.build_id,
                status = ?report.builder_status,
                "Worker lost track of its build"
            );
            self.rescue(&report).await;
            farm.store.release(candidate.job.id).await?;
            return Ok(());
        }

        let handled = handle_status(
            farm,
            self.transport.as_ref(),
            worker,
            candidate,
            &report,
            ctx,
        )
        .await?;
        debug!(cookie = %cookie, ?handled, "Handled polled status");
        Ok(())
    }

    /// Get a worker that holds an unexpected build back to IDLE.
    async fn rescue(&self, report: &StatusReport) {
        let result = match report.builder_status {
            WorkerStatus::Waiting | WorkerStatus::Aborted => self.transport.clean().await,
            WorkerStatus::Building => self.transport.abort().await,
            WorkerStatus::Aborting | WorkerStatus::Idle => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "Rescuing worker failed");
        }
    }

    async fn find_work(&mut self, worker: &Worker, ctx: &ScanContext) -> Result<()> {
        if !worker.is_schedulable() {
            return Ok(());
        }

        // Native workers are not reset before a build, so make sure they are
        // really idle.
        if !worker.virtualized {
            match self.transport.poll_status().await {
                Ok(report) if report.builder_status == WorkerStatus::Idle => {}
                Ok(report) => {
                    warn!(
                        status = ?report.builder_status,
                        cookie = ?report.build_id,
                        "Idle worker is busy"
                    );
                    self.rescue(&report).await;
                    return Ok(());
                }
                Err(e) => {
                    record_worker_failure(
                        &self.farm,
                        self.transport.as_ref(),
                        worker.id,
                        &e.to_string(),
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        let Some(candidate) = acquire_candidate(&self.farm, worker, ctx).await? else {
            return Ok(());
        };
        match dispatch(&self.farm, self.transport.as_ref(), worker, &candidate, ctx).await {
            Ok(outcome) => {
                self.last_contact = Instant::now();
                info!(cookie = %outcome.cookie, files = outcome.staged_files, "Build dispatched");
            }
            Err(e) => debug!(error = %e, "Dispatch failed"),
        }
        Ok(())
    }

    /// A report the worker pushed instead of waiting to be polled.
    async fn handle_pushed(&mut self, report: StatusReport) -> Result<()> {
        let worker = self.farm.store.get_worker(self.worker_id).await?;
        let ctx = ScanContext::for_worker(&worker);
        let Some(candidate) = self.farm.store.current_job_for(worker.id).await? else {
            debug!(worker = %worker.name, "Discarding report from worker without a build");
            return Ok(());
        };
        let handled = handle_status(
            &self.farm,
            self.transport.as_ref(),
            &worker,
            &candidate,
            &report,
            &ctx,
        )
        .await?;
        if handled != Handled::Discarded {
            self.last_contact = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, package_spec};
    use buildfarm_core::build::BuildSpec;
    use buildfarm_core::job::JobStatus;
    use buildfarm_core::report::BuildOutcome;
    use buildfarm_db::JobStore;
    use std::time::Duration;

    struct Fixture {
        h: Harness,
        scanner: WorkerScanner,
        worker: Worker,
        reports: mpsc::Sender<StatusReport>,
        shutdown: watch::Sender<bool>,
    }

    async fn fixture(virtualized: bool) -> Fixture {
        let h = Harness::new();
        let worker = h.add_worker("bob", virtualized).await;
        let (reports, rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scanner = WorkerScanner::new(
            h.farm.clone(),
            worker.id,
            h.transport.clone(),
            rx,
            shutdown_rx,
        );
        Fixture {
            h,
            scanner,
            worker,
            reports,
            shutdown,
        }
    }

    fn cookie(candidate: &Candidate) -> String {
        format!("PACKAGEBUILD-{}", candidate.build.id)
    }

    async fn mark_cancelling(h: &Harness, candidate: &Candidate) {
        assert!(h.store.mark_cancelling(candidate.build.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_worker_gets_dispatched_then_finishes() {
        let mut f = fixture(true).await;
        let queued = f
            .h
            .queue(BuildSpec::BinaryPackage(package_spec(true, false)), 10)
            .await;

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.job(queued.job.id).await.status, JobStatus::Running);
        assert_eq!(f.h.transport.count("start_build"), 1);

        let mut report = StatusReport::waiting(cookie(&queued), BuildOutcome::Ok);
        report
            .filemap
            .insert("out.bin".to_string(), f.h.transport.add_file(b"ELF"));
        f.h.transport.set_status(report);

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.build(queued.build.id).await.status, BuildStatus::FullyBuilt);
        assert_eq!(
            f.h.store.get_worker(f.worker.id).await.unwrap().failure_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_timeout_cleans_before_new_work() {
        let mut f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        mark_cancelling(&f.h, &c).await;
        f.h.transport.set_status(StatusReport::building(cookie(&c)));

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.transport.count("abort"), 1);
        assert_eq!(f.h.build(c.build.id).await.status, BuildStatus::Cancelling);

        tokio::time::advance(Duration::from_secs(60)).await;
        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.transport.count("abort"), 1);
        assert_eq!(f.h.build(c.build.id).await.status, BuildStatus::Cancelling);

        tokio::time::advance(Duration::from_secs(121)).await;
        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.build(c.build.id).await.status, BuildStatus::Cancelled);
        assert_eq!(f.h.job(c.job.id).await.status, JobStatus::Failed);
        assert_eq!(
            f.h.store.get_worker(f.worker.id).await.unwrap().failure_count,
            1
        );
        assert_eq!(f.h.notifier.statuses(), vec![BuildStatus::Cancelled]);

        f.h.queue(BuildSpec::BinaryPackage(package_spec(true, false)), 10)
            .await;
        f.scanner.scan_once().await.unwrap();
        let calls = f.h.transport.calls();
        let clean = calls.iter().position(|c| c == "clean").unwrap();
        let start = calls.iter().position(|c| c == "start_build").unwrap();
        assert!(clean < start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_confirmed_by_worker() {
        let mut f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        mark_cancelling(&f.h, &c).await;
        f.h.transport.set_status(StatusReport::aborted(cookie(&c)));

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.build(c.build.id).await.status, BuildStatus::Cancelled);
        assert_eq!(
            f.h.store.get_worker(f.worker.id).await.unwrap().failure_count,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_loses_its_build() {
        let mut f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        f.h.transport.fail_on("poll_status");

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.job(c.job.id).await.status, JobStatus::Running);

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        f.scanner.scan_once().await.unwrap();

        let job = f.h.job(c.job.id).await;
        assert!(job.is_claimable());
        assert_eq!(f.h.build(c.build.id).await.failure_count, 1);
        assert_eq!(
            f.h.store.get_worker(f.worker.id).await.unwrap().failure_count,
            1
        );
    }

    #[tokio::test]
    async fn test_worker_holding_another_build_is_rescued() {
        let mut f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        f.h.transport
            .set_status(StatusReport::building("PACKAGEBUILD-999"));

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.transport.count("abort"), 1);
        assert!(f.h.job(c.job.id).await.is_claimable());
        assert_eq!(
            f.h.store.get_worker(f.worker.id).await.unwrap().failure_count,
            0
        );
    }

    #[tokio::test]
    async fn test_busy_native_worker_is_cleaned_not_dispatched() {
        let mut f = fixture(false).await;
        let queued = f
            .h
            .queue(BuildSpec::BinaryPackage(package_spec(false, false)), 10)
            .await;
        f.h.transport
            .set_status(StatusReport::waiting("PACKAGEBUILD-999", BuildOutcome::Ok));

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.transport.count("clean"), 1);
        assert_eq!(f.h.transport.count("start_build"), 0);
        assert!(f.h.job(queued.job.id).await.is_claimable());

        f.scanner.scan_once().await.unwrap();
        assert_eq!(f.h.transport.count("start_build"), 1);
    }

    #[tokio::test]
    async fn test_disabled_worker_gives_back_its_job() {
        let mut f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        f.h.store.disable_worker(f.worker.id, "operator").await.unwrap();

        f.scanner.scan_once().await.unwrap();
        assert!(f.h.job(c.job.id).await.is_claimable());
        assert!(f.h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handles_pushed_reports_and_shutdown() {
        let f = fixture(true).await;
        let c = f.h.claimed(&f.worker).await;
        // Polls keep saying BUILDING; only the pushed report finishes it.
        f.h.transport.set_status(StatusReport::building(cookie(&c)));

        let h = f.h;
        let handle = tokio::spawn(f.scanner.run());
        f.reports
            .send(StatusReport::waiting(cookie(&c), BuildOutcome::PackageFail))
            .await
            .unwrap();

        for _ in 0..50 {
            if h.build(c.build.id).await.status == BuildStatus::FailedToBuild {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.build(c.build.id).await.status, BuildStatus::FailedToBuild);

        f.shutdown.send(true).unwrap();
        handle.await.unwrap();
    }
}
