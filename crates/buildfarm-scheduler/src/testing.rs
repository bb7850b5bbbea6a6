//! Fixtures and hand-written mocks shared by the scheduler tests.

use async_trait::async_trait;
use buildfarm_core::artifact::{ArtifactRef, Librarian, Upload, content_hash};
use buildfarm_core::build::{
    Archive, ArchivePurpose, BinaryPackageSpec, Build, BuildSpec, BuildStatus, FileRef, Pocket,
    SeriesStatus, TranslationTemplatesSpec,
};
use buildfarm_core::dispatch::{Credentials, DispatchRequest, StartResponse};
use buildfarm_core::job::{Candidate, Job, JobStatus};
use buildfarm_core::notify::{BuildNotification, Notifier};
use buildfarm_core::report::{StatusReport, WorkerStatus};
use buildfarm_core::transport::{TransportFactory, WorkerTransport};
use buildfarm_core::worker::{NewWorker, Worker};
use buildfarm_core::{BuildId, Error, JobId, Result, WorkerId};
use buildfarm_db::{JobStore, MemoryJobStore, NewBuild};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::behavior::BehaviorRegistry;
use crate::farm::{Farm, SchedulerSettings};
use crate::signer::PrivateFileSigner;

pub fn sample_worker(virtualized: bool) -> Worker {
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

pub fn file_ref(filename: &str, data: &[u8]) -> FileRef {
    let hash = content_hash(data);
    FileRef {
        filename: filename.to_string(),
        url: format!("https://librarian.example.com/{}/{}", &hash[..8], filename),
        content_hash: hash,
        size: data.len() as u64,
    }
}

pub fn package_spec(require_virtualized: bool, private: bool) -> BinaryPackageSpec {
    BinaryPackageSpec {
        source_name: "hello".to_string(),
        version: "2.10-1".to_string(),
        series: "noble".to_string(),
        series_status: SeriesStatus::Development,
        arch_tag: "i386".to_string(),
        processor: "386".to_string(),
        arch_indep: true,
        pocket: Pocket::Release,
        component: "main".to_string(),
        archive: Archive {
            name: if private { "cprov-secret" } else { "primary" }.to_string(),
            purpose: if private {
                ArchivePurpose::Ppa
            } else {
                ArchivePurpose::Primary
            },
            private,
            require_virtualized,
            enabled: true,
            build_debug_symbols: false,
            relative_build_score: 0,
        },
        archives: Vec::new(),
        chroot: Some(file_ref("chroot-ubuntu-noble-i386.tar.gz", b"chroot")),
        files: vec![file_ref("hello_2.10-1.dsc", b"dsc")],
    }
}

pub fn templates_spec() -> TranslationTemplatesSpec {
    TranslationTemplatesSpec {
        branch_url: "https://code.example.com/hello/trunk".to_string(),
        series: "noble".to_string(),
        arch_tag: "i386".to_string(),
        chroot: Some(file_ref("chroot-ubuntu-noble-i386.tar.gz", b"chroot")),
    }
}

pub fn build_from(spec: BuildSpec) -> Build {
    Build {
        id: BuildId::new(1),
        status: BuildStatus::NeedsBuild,
        builder: None,
        failure_count: 0,
        dependencies: None,
        date_created: Utc::now(),
        date_started: None,
        date_finished: None,
        log: None,
        files: Vec::new(),
        spec,
    }
}

pub fn candidate_from(build: Build) -> Candidate {
    let job = Job {
        id: JobId::new(1),
        build_id: build.id,
        job_type: build.job_type(),
        processor: build.spec.processor().map(str::to_string),
        virtualized: build.spec.required_virtualization(),
        score: 0,
        manual_score: false,
        status: JobStatus::Waiting,
        claimed_by: None,
        requesting_principal: None,
        logtail: None,
        date_created: Utc::now(),
        date_started: None,
    };
    Candidate { job, build }
}

/// Scriptable worker transport that records every call.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    status: Mutex<Option<StatusReport>>,
    start_status: Mutex<Option<WorkerStatus>>,
    files: Mutex<HashMap<String, Bytes>>,
    cached: Mutex<Vec<(String, String, Option<Credentials>)>>,
    requests: Mutex<Vec<DispatchRequest>>,
    resume_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn call(&self, method: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.failing.lock().unwrap().contains(method) {
            return Err(Error::Transport(format!("{} failed", method)));
        }
        Ok(())
    }

    pub fn fail_on(&self, method: &'static str) {
        self.failing.lock().unwrap().insert(method);
    }

    pub fn succeed_on(&self, method: &'static str) {
        self.failing.lock().unwrap().remove(method);
    }

    /// Report returned by every poll until changed. Defaults to IDLE.
    pub fn set_status(&self, report: StatusReport) {
        *self.status.lock().unwrap() = Some(report);
    }

    pub fn set_start_status(&self, status: WorkerStatus) {
        *self.start_status.lock().unwrap() = Some(status);
    }

    /// Put a file in the worker's cache and return its hash.
    pub fn add_file(&self, data: &'static [u8]) -> String {
        let hash = content_hash(data);
        self.serve(&hash, data);
        hash
    }

    /// Serve `data` under `hash`, whether or not it matches.
    pub fn serve(&self, hash: &str, data: &'static [u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(hash.to_string(), Bytes::from_static(data));
    }

    /// Park the next `resume` until released. Returns the notify fired when
    /// resume is entered and the one that lets it continue.
    pub fn hold_resume(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.resume_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == method).count()
    }

    pub fn cached(&self) -> Vec<(String, String, Option<Credentials>)> {
        self.cached.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<DispatchRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn echo(&self, message: &str) -> Result<String> {
        self.call("echo")?;
        Ok(message.to_string())
    }

    async fn cache_file(
        &self,
        content_hash: &str,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        self.call("cache_file")?;
        self.cached.lock().unwrap().push((
            content_hash.to_string(),
            url.to_string(),
            credentials.cloned(),
        ));
        Ok(())
    }

    async fn start_build(&self, request: &DispatchRequest) -> Result<StartResponse> {
        self.call("start_build")?;
        self.requests.lock().unwrap().push(request.clone());
        let status = self
            .start_status
            .lock()
            .unwrap()
            .unwrap_or(WorkerStatus::Building);
        Ok(StartResponse {
            status,
            info: String::new(),
        })
    }

    async fn poll_status(&self) -> Result<StatusReport> {
        self.call("poll_status")?;
        Ok(self
            .status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(StatusReport::idle))
    }

    async fn abort(&self) -> Result<()> {
        self.call("abort")
    }

    async fn clean(&self) -> Result<()> {
        self.call("clean")?;
        *self.status.lock().unwrap() = None;
        Ok(())
    }

    async fn get_file(&self, content_hash: &str) -> Result<Bytes> {
        self.call("get_file")?;
        self.files
            .lock()
            .unwrap()
            .get(content_hash)
            .cloned()
            .ok_or_else(|| Error::NotFound(content_hash.to_string()))
    }

    async fn resume(&self) -> Result<()> {
        let gate = self.resume_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.call("resume")
    }
}

/// Hands the same mock to every worker.
pub struct MockFactory {
    pub transport: Arc<MockTransport>,
}

impl TransportFactory for MockFactory {
    fn connect(&self, _worker: &Worker) -> Arc<dyn WorkerTransport> {
        self.transport.clone()
    }
}

#[derive(Default)]
pub struct MockLibrarian {
    uploads: Mutex<Vec<ArtifactRef>>,
    failing: Mutex<bool>,
}

impl MockLibrarian {
    pub fn uploaded(&self) -> Vec<ArtifactRef> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn fail_uploads(&self) {
        *self.failing.lock().unwrap() = true;
    }
}

#[async_trait]
impl Librarian for MockLibrarian {
    async fn upload(&self, upload: Upload) -> Result<ArtifactRef> {
        if *self.failing.lock().unwrap() {
            return Err(Error::Upload("librarian unavailable".to_string()));
        }
        let checksum = content_hash(&upload.data);
        let artifact = ArtifactRef {
            location: format!("mem://{}/{}", checksum, upload.name),
            name: upload.name,
            checksum,
            size: upload.data.len() as u64,
            content_type: upload.content_type,
            restricted: upload.restricted,
            created_at: Utc::now(),
        };
        self.uploads.lock().unwrap().push(artifact.clone());
        Ok(artifact)
    }

    async fn download(&self, reference: &ArtifactRef) -> Result<Bytes> {
        Err(Error::NotFound(reference.location.clone()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<BuildNotification>>,
    disabled: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn statuses(&self) -> Vec<BuildStatus> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.status)
            .collect()
    }

    pub fn notifications(&self) -> Vec<BuildNotification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn disabled_workers(&self) -> Vec<String> {
        self.disabled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &BuildNotification) -> Result<()> {
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn worker_disabled(&self, worker: &Worker, _reason: &str) -> Result<()> {
        self.disabled.lock().unwrap().push(worker.name.clone());
        Ok(())
    }
}

fn signing_settings() -> SchedulerSettings {
    SchedulerSettings {
        private_files: Some(PrivateFileSigner::new(
            "https://private.example.com/files",
            "s3kr1t",
        )),
        ..SchedulerSettings::default()
    }
}

/// A farm over the in-memory store with every collaborator mocked.
pub struct Harness {
    pub farm: Arc<Farm>,
    pub store: Arc<MemoryJobStore>,
    pub librarian: Arc<MockLibrarian>,
    pub notifier: Arc<RecordingNotifier>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::assemble(signing_settings(), BehaviorRegistry::new())
    }

    pub fn with_settings(settings: SchedulerSettings) -> Self {
        Self::assemble(settings, BehaviorRegistry::new())
    }

    /// Some job types behaving differently.
    pub fn with_behaviors(behaviors: BehaviorRegistry) -> Self {
        Self::assemble(signing_settings(), behaviors)
    }

    fn assemble(settings: SchedulerSettings, behaviors: BehaviorRegistry) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let librarian = Arc::new(MockLibrarian::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut farm = Farm::new(
            store.clone(),
            librarian.clone(),
            notifier.clone(),
            settings,
        );
        farm.behaviors = behaviors;
        Self {
            farm: Arc::new(farm),
            store,
            librarian,
            notifier,
            transport: MockTransport::new(),
        }
    }

    pub async fn add_worker(&self, name: &str, virtualized: bool) -> Worker {
        self.store
            .register_worker(NewWorker {
                name: name.to_string(),
                url: format!("http://{}:8221", name),
                processor: "386".to_string(),
                virtualized,
                vm_host: virtualized.then(|| "host1".to_string()),
                manual: false,
                active: true,
            })
            .await
            .unwrap()
    }

    pub async fn queue(&self, spec: BuildSpec, score: i32) -> Candidate {
        self.store
            .queue_build(NewBuild {
                spec,
                score,
                requesting_principal: None,
            })
            .await
            .unwrap()
    }

    /// Queue a package build and claim it for `worker`.
    pub async fn claimed(&self, worker: &Worker) -> Candidate {
        let spec = package_spec(worker.virtualized, false);
        let queued = self.queue(BuildSpec::BinaryPackage(spec), 2500).await;
        self.store
            .try_claim(queued.job.id, worker.id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn build(&self, id: BuildId) -> Build {
        self.store.get_build(id).await.unwrap()
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.store.get_job(id).await.unwrap()
    }
}
