//! In-memory job store.
//!
//! Used when no database is configured, and as the fixture store in tests.
//! Every operation runs under a single lock so the claim is one
//! check-and-set.

use async_trait::async_trait;
use buildfarm_core::build::{Build, BuildStatus};
use buildfarm_core::job::{Candidate, Job, JobStatus, is_compatible, queue_order};
use buildfarm_core::worker::{NewWorker, Worker};
use buildfarm_core::{BuildId, JobId, WorkerId};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::store::{JobStore, NewBuild, job_requirements};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    workers: BTreeMap<WorkerId, Worker>,
    jobs: BTreeMap<JobId, Job>,
    builds: BTreeMap<BuildId, Build>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn worker_mut(&mut self, id: WorkerId) -> DbResult<&mut Worker> {
        self.workers
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))
    }

    fn job(&self, id: JobId) -> DbResult<&Job> {
        self.jobs
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    fn job_mut(&mut self, id: JobId) -> DbResult<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    fn build(&self, id: BuildId) -> DbResult<&Build> {
        self.builds
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn build_mut(&mut self, id: BuildId) -> DbResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn candidate(&self, job: &Job) -> DbResult<Candidate> {
        Ok(Candidate {
            job: job.clone(),
            build: self.build(job.build_id)?.clone(),
        })
    }
}

/// Job store held entirely in process memory.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn register_worker(&self, new: NewWorker) -> DbResult<Worker> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.workers.values_mut().find(|w| w.name == new.name) {
            existing.url = new.url;
            existing.processor = new.processor;
            existing.virtualized = new.virtualized;
            existing.vm_host = new.vm_host;
            existing.manual = new.manual;
            existing.active = new.active;
            return Ok(existing.clone());
        }

        let id = WorkerId::new(state.next_id());
        let worker = Worker {
            id,
            name: new.name,
            url: new.url,
            processor: new.processor,
            virtualized: new.virtualized,
            vm_host: new.vm_host,
            ok: true,
            failure_count: 0,
            reset_failure_count: 0,
            manual: new.manual,
            active: new.active,
            fail_notes: None,
        };
        state.workers.insert(id, worker.clone());
        Ok(worker)
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        let state = self.state.lock().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker> {
        let state = self.state.lock().await;
        state
            .workers
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))
    }

    async fn get_worker_by_name(&self, name: &str) -> DbResult<Worker> {
        let state = self.state.lock().await;
        state
            .workers
            .values()
            .find(|w| w.name == name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))
    }

    async fn save_worker(&self, worker: &Worker) -> DbResult<()> {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&worker.id) {
            Some(existing) => {
                *existing = worker.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("worker {}", worker.id))),
        }
    }

    async fn add_worker_failure(&self, id: WorkerId) -> DbResult<Worker> {
        let mut state = self.state.lock().await;
        let worker = state.worker_mut(id)?;
        worker.failure_count = worker.failure_count.saturating_add(1);
        Ok(worker.clone())
    }

    async fn record_reset(&self, id: WorkerId, succeeded: bool) -> DbResult<Worker> {
        let mut state = self.state.lock().await;
        let worker = state.worker_mut(id)?;
        worker.reset_failure_count = if succeeded {
            0
        } else {
            worker.reset_failure_count.saturating_add(1)
        };
        Ok(worker.clone())
    }

    async fn clear_worker_failures(&self, id: WorkerId) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.worker_mut(id)?.reset_failure_counts();
        Ok(())
    }

    async fn disable_worker(&self, id: WorkerId, reason: &str) -> DbResult<Option<Worker>> {
        let mut state = self.state.lock().await;
        let worker = state.worker_mut(id)?;
        if !worker.ok {
            return Ok(None);
        }
        worker.disable(reason);
        Ok(Some(worker.clone()))
    }

    async fn enable_worker(&self, id: WorkerId) -> DbResult<Worker> {
        let mut state = self.state.lock().await;
        let worker = state.worker_mut(id)?;
        worker.enable();
        worker.fail_notes = None;
        Ok(worker.clone())
    }

    async fn queue_build(&self, new: NewBuild) -> DbResult<Candidate> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let (processor, virtualized) = job_requirements(&new.spec);

        let build = Build {
            id: BuildId::new(state.next_id()),
            status: BuildStatus::NeedsBuild,
            builder: None,
            failure_count: 0,
            dependencies: None,
            date_created: now,
            date_started: None,
            date_finished: None,
            log: None,
            files: Vec::new(),
            spec: new.spec,
        };
        let job = Job {
            id: JobId::new(state.next_id()),
            build_id: build.id,
            job_type: build.job_type(),
            processor,
            virtualized,
            score: new.score,
            manual_score: false,
            status: JobStatus::Waiting,
            claimed_by: None,
            requesting_principal: new.requesting_principal,
            logtail: None,
            date_created: now,
            date_started: None,
        };

        state.builds.insert(build.id, build.clone());
        state.jobs.insert(job.id, job.clone());
        Ok(Candidate { job, build })
    }

    async fn candidates(&self, worker: &Worker) -> DbResult<Vec<Candidate>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.is_claimable() && is_compatible(worker, j))
            .collect();
        jobs.sort_by(|a, b| queue_order(a, b));
        jobs.into_iter().map(|j| state.candidate(j)).collect()
    }

    async fn try_claim(&self, job_id: JobId, worker: WorkerId) -> DbResult<Option<Candidate>> {
        let mut state = self.state.lock().await;
        if !state.job(job_id)?.is_claimable() {
            return Ok(None);
        }
        if state.jobs.values().any(|j| j.claimed_by == Some(worker)) {
            return Err(DbError::Conflict(format!(
                "worker {} already holds a claim",
                worker
            )));
        }

        let now = Utc::now();
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Running;
        job.claimed_by = Some(worker);
        job.date_started = Some(now);
        let job = job.clone();

        let build = state.build_mut(job.build_id)?;
        build.status = BuildStatus::Building;
        build.builder = Some(worker);
        build.date_started = Some(now);
        let build = build.clone();

        Ok(Some(Candidate { job, build }))
    }

    async fn release(&self, job_id: JobId) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.status = JobStatus::Waiting;
        job.claimed_by = None;
        job.date_started = None;
        job.logtail = None;
        let build_id = job.build_id;

        let build = state.build_mut(build_id)?;
        build.status = BuildStatus::NeedsBuild;
        build.date_started = None;
        Ok(())
    }

    async fn finish(&self, job_id: JobId, status: JobStatus) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.status = status;
        job.claimed_by = None;
        Ok(())
    }

    async fn requeue(&self, build_id: BuildId, score: i32) -> DbResult<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .values_mut()
            .find(|j| j.build_id == build_id)
            .ok_or_else(|| DbError::NotFound(format!("job for build {}", build_id)))?;
        job.status = JobStatus::Waiting;
        job.claimed_by = None;
        job.score = score;
        job.manual_score = false;
        job.logtail = None;
        job.date_started = None;
        Ok(job.clone())
    }

    async fn rescore(&self, job_id: JobId, score: i32, manual: bool) -> DbResult<Job> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.score = score;
        job.manual_score = manual;
        Ok(job.clone())
    }

    async fn withdraw(&self, job_id: JobId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        if !job.is_claimable() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> DbResult<Job> {
        let state = self.state.lock().await;
        state.job(id).cloned()
    }

    async fn job_for_build(&self, build: BuildId) -> DbResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|j| j.build_id == build)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job for build {}", build)))
    }

    async fn save_job(&self, job: &Job) -> DbResult<()> {
        let mut state = self.state.lock().await;
        *state.job_mut(job.id)? = job.clone();
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        let state = self.state.lock().await;
        state.build(id).cloned()
    }

    async fn save_build(&self, build: &Build) -> DbResult<()> {
        let mut state = self.state.lock().await;
        *state.build_mut(build.id)? = build.clone();
        Ok(())
    }

    async fn add_build_failure(&self, id: BuildId) -> DbResult<u32> {
        let mut state = self.state.lock().await;
        let build = state.build_mut(id)?;
        build.failure_count = build.failure_count.saturating_add(1);
        Ok(build.failure_count)
    }

    async fn mark_cancelling(&self, id: BuildId) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let build = state.build_mut(id)?;
        if build.status != BuildStatus::Building {
            return Ok(false);
        }
        build.status = BuildStatus::Cancelling;
        Ok(true)
    }

    async fn current_job_for(&self, worker: WorkerId) -> DbResult<Option<Candidate>> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|j| j.claimed_by == Some(worker))
            .map(|j| state.candidate(j))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_worker, package_build};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_candidates_are_compatible_and_ordered() {
        let store = MemoryJobStore::new();
        let worker = store.register_worker(new_worker("bob", true)).await.unwrap();

        let low = store.queue_build(package_build("386", true, 10)).await.unwrap();
        let high = store.queue_build(package_build("386", true, 20)).await.unwrap();
        let tie = store.queue_build(package_build("386", true, 10)).await.unwrap();
        store.queue_build(package_build("amd64", true, 100)).await.unwrap();
        store.queue_build(package_build("386", false, 100)).await.unwrap();

        let ids: Vec<JobId> = store
            .candidates(&worker)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.job.id)
            .collect();
        assert_eq!(ids, vec![high.job.id, low.job.id, tie.job.id]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(MemoryJobStore::new());
        let queued = store.queue_build(package_build("386", true, 0)).await.unwrap();

        let mut workers = Vec::new();
        for i in 0..8 {
            let w = store
                .register_worker(new_worker(&format!("w{}", i), true))
                .await
                .unwrap();
            workers.push(w.id);
        }

        let claims = futures::future::join_all(workers.into_iter().map(|w| {
            let store = Arc::clone(&store);
            let job = queued.job.id;
            async move { store.try_claim(job, w).await.unwrap() }
        }))
        .await;

        let winners: Vec<_> = claims.into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].job.status, JobStatus::Running);
        assert_eq!(winners[0].build.status, BuildStatus::Building);
        assert_eq!(winners[0].build.builder, winners[0].job.claimed_by);
    }

    #[tokio::test]
    async fn test_release_returns_job_to_queue() {
        let store = MemoryJobStore::new();
        let worker = store.register_worker(new_worker("bob", true)).await.unwrap();
        let queued = store.queue_build(package_build("386", true, 0)).await.unwrap();

        store.try_claim(queued.job.id, worker.id).await.unwrap().unwrap();
        assert!(store.current_job_for(worker.id).await.unwrap().is_some());

        store.release(queued.job.id).await.unwrap();
        let job = store.get_job(queued.job.id).await.unwrap();
        assert!(job.is_claimable());
        let build = store.get_build(queued.build.id).await.unwrap();
        assert_eq!(build.status, BuildStatus::NeedsBuild);
        assert!(store.current_job_for(worker.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_holds_one_claim() {
        let store = MemoryJobStore::new();
        let worker = store.register_worker(new_worker("bob", true)).await.unwrap();
        let a = store.queue_build(package_build("386", true, 0)).await.unwrap();
        let b = store.queue_build(package_build("386", true, 0)).await.unwrap();

        store.try_claim(a.job.id, worker.id).await.unwrap().unwrap();
        assert!(matches!(
            store.try_claim(b.job.id, worker.id).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_register_worker_keeps_health() {
        let store = MemoryJobStore::new();
        let mut worker = store.register_worker(new_worker("bob", true)).await.unwrap();
        worker.disable("broken");
        worker.failure_count = 3;
        store.save_worker(&worker).await.unwrap();

        let mut update = new_worker("bob", true);
        update.url = "http://bob:9999".to_string();
        let again = store.register_worker(update).await.unwrap();
        assert_eq!(again.id, worker.id);
        assert_eq!(again.url, "http://bob:9999");
        assert!(!again.ok);
        assert_eq!(again.failure_count, 3);
    }

    #[tokio::test]
    async fn test_worker_counters_update_in_place() {
        let store = MemoryJobStore::new();
        let worker = store.register_worker(new_worker("bob", true)).await.unwrap();

        store.add_worker_failure(worker.id).await.unwrap();
        let counted = store.add_worker_failure(worker.id).await.unwrap();
        assert_eq!(counted.failure_count, 2);

        // An operator disable in between must survive the reset bookkeeping.
        assert!(store.disable_worker(worker.id, "operator").await.unwrap().is_some());
        let after = store.record_reset(worker.id, false).await.unwrap();
        assert!(!after.ok);
        assert_eq!(after.reset_failure_count, 1);
        assert_eq!(after.failure_count, 2);
        assert!(store.disable_worker(worker.id, "again").await.unwrap().is_none());

        let enabled = store.enable_worker(worker.id).await.unwrap();
        assert!(enabled.ok);
        assert_eq!(enabled.failure_count, 0);
        assert!(enabled.fail_notes.is_none());
    }

    #[tokio::test]
    async fn test_withdraw_and_mark_cancelling_respect_claims() {
        let store = MemoryJobStore::new();
        let worker = store.register_worker(new_worker("bob", true)).await.unwrap();
        let queued = store.queue_build(package_build("386", true, 0)).await.unwrap();

        assert!(!store.mark_cancelling(queued.build.id).await.unwrap());
        store.try_claim(queued.job.id, worker.id).await.unwrap().unwrap();
        assert!(!store.withdraw(queued.job.id).await.unwrap());
        assert!(store.mark_cancelling(queued.build.id).await.unwrap());

        let other = store.queue_build(package_build("386", true, 0)).await.unwrap();
        assert!(store.withdraw(other.job.id).await.unwrap());
        assert_eq!(
            store.get_job(other.job.id).await.unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(store.add_build_failure(other.build.id).await.unwrap(), 1);
    }
}
