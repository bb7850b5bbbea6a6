//! PostgreSQL job store.

use async_trait::async_trait;
use buildfarm_core::artifact::ArtifactRef;
use buildfarm_core::build::{Build, BuildSpec};
use buildfarm_core::job::{Candidate, Job, JobStatus};
use buildfarm_core::worker::{NewWorker, Worker};
use buildfarm_core::{BuildId, JobId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::store::{JobStore, NewBuild, job_requirements};
use crate::{DbError, DbResult};

/// A worker record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub processor: String,
    pub virtualized: bool,
    pub vm_host: Option<String>,
    pub ok: bool,
    pub failure_count: i32,
    pub reset_failure_count: i32,
    pub manual: bool,
    pub active: bool,
    pub fail_notes: Option<String>,
}

impl From<WorkerRecord> for Worker {
    fn from(r: WorkerRecord) -> Self {
        Worker {
            id: WorkerId::new(r.id),
            name: r.name,
            url: r.url,
            processor: r.processor,
            virtualized: r.virtualized,
            vm_host: r.vm_host,
            ok: r.ok,
            failure_count: r.failure_count.max(0) as u32,
            reset_failure_count: r.reset_failure_count.max(0) as u32,
            manual: r.manual,
            active: r.active,
            fail_notes: r.fail_notes,
        }
    }
}

/// A job record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub build_id: i64,
    pub job_type: String,
    pub processor: Option<String>,
    pub virtualized: Option<bool>,
    pub score: i32,
    pub manual_score: bool,
    pub status: String,
    pub claimed_by: Option<i64>,
    pub requesting_principal: Option<String>,
    pub logtail: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        Ok(Job {
            id: JobId::new(r.id),
            build_id: BuildId::new(r.build_id),
            job_type: r.job_type.parse()?,
            processor: r.processor,
            virtualized: r.virtualized,
            score: r.score,
            manual_score: r.manual_score,
            status: r.status.parse()?,
            claimed_by: r.claimed_by.map(WorkerId::new),
            requesting_principal: r.requesting_principal,
            logtail: r.logtail,
            date_created: r.date_created,
            date_started: r.date_started,
        })
    }
}

/// A build record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub status: String,
    pub builder: Option<i64>,
    pub failure_count: i32,
    pub dependencies: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
    pub log: Option<serde_json::Value>,
    pub files: serde_json::Value,
    pub spec: serde_json::Value,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(r: BuildRecord) -> DbResult<Self> {
        let log: Option<ArtifactRef> = r.log.map(serde_json::from_value).transpose()?;
        let files: Vec<ArtifactRef> = serde_json::from_value(r.files)?;
        let spec: BuildSpec = serde_json::from_value(r.spec)?;
        Ok(Build {
            id: BuildId::new(r.id),
            status: r.status.parse()?,
            builder: r.builder.map(WorkerId::new),
            failure_count: r.failure_count.max(0) as u32,
            dependencies: r.dependencies,
            date_created: r.date_created,
            date_started: r.date_started,
            date_finished: r.date_finished,
            log,
            files,
            spec,
        })
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_builds(&self, jobs: Vec<JobRecord>) -> DbResult<Vec<Candidate>> {
        let ids: Vec<i64> = jobs.iter().map(|j| j.build_id).collect();
        let mut builds: HashMap<i64, BuildRecord> =
            sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = ANY($1)")
                .bind(&ids[..])
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|b| (b.id, b))
                .collect();

        jobs.into_iter()
            .map(|job| {
                let build = builds
                    .remove(&job.build_id)
                    .ok_or_else(|| DbError::NotFound(format!("build {}", job.build_id)))?;
                Ok(Candidate {
                    job: job.try_into()?,
                    build: build.try_into()?,
                })
            })
            .collect()
    }
}

fn claim_error(worker: WorkerId) -> impl FnOnce(sqlx::Error) -> DbError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DbError::Conflict(format!("worker {} already holds a claim", worker))
        }
        _ => DbError::Database(err),
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn register_worker(&self, new: NewWorker) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            INSERT INTO workers (name, url, processor, virtualized, vm_host, manual, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                url = EXCLUDED.url,
                processor = EXCLUDED.processor,
                virtualized = EXCLUDED.virtualized,
                vm_host = EXCLUDED.vm_host,
                manual = EXCLUDED.manual,
                active = EXCLUDED.active
            RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.url)
        .bind(&new.processor)
        .bind(new.virtualized)
        .bind(&new.vm_host)
        .bind(new.manual)
        .bind(new.active)
        .fetch_one(&self.pool)
        .await?;
        Ok(record.into())
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        let records = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(records.into_iter().map(Worker::from).collect())
    }

    async fn get_worker(&self, id: WorkerId) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;
        Ok(record.into())
    }

    async fn get_worker_by_name(&self, name: &str) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))?;
        Ok(record.into())
    }

    async fn save_worker(&self, worker: &Worker) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers SET
                url = $2, processor = $3, virtualized = $4, vm_host = $5, ok = $6,
                failure_count = $7, reset_failure_count = $8, manual = $9, active = $10,
                fail_notes = $11
            WHERE id = $1
            "#,
        )
        .bind(worker.id.get())
        .bind(&worker.url)
        .bind(&worker.processor)
        .bind(worker.virtualized)
        .bind(&worker.vm_host)
        .bind(worker.ok)
        .bind(to_i32(worker.failure_count))
        .bind(to_i32(worker.reset_failure_count))
        .bind(worker.manual)
        .bind(worker.active)
        .bind(&worker.fail_notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("worker {}", worker.id)));
        }
        Ok(())
    }

    async fn add_worker_failure(&self, id: WorkerId) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            "UPDATE workers SET failure_count = failure_count + 1 WHERE id = $1 RETURNING *",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;
        Ok(record.into())
    }

    async fn record_reset(&self, id: WorkerId, succeeded: bool) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            UPDATE workers
            SET reset_failure_count = CASE WHEN $2 THEN 0 ELSE reset_failure_count + 1 END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.get())
        .bind(succeeded)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;
        Ok(record.into())
    }

    async fn clear_worker_failures(&self, id: WorkerId) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE workers SET failure_count = 0, reset_failure_count = 0 WHERE id = $1",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("worker {}", id)));
        }
        Ok(())
    }

    async fn disable_worker(&self, id: WorkerId, reason: &str) -> DbResult<Option<Worker>> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            "UPDATE workers SET ok = FALSE, fail_notes = $2 WHERE id = $1 AND ok RETURNING *",
        )
        .bind(id.get())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        match record {
            Some(record) => Ok(Some(record.into())),
            None => {
                // Distinguish "already disabled" from "no such worker".
                self.get_worker(id).await?;
                Ok(None)
            }
        }
    }

    async fn enable_worker(&self, id: WorkerId) -> DbResult<Worker> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            UPDATE workers SET
                failure_count = CASE WHEN ok THEN failure_count ELSE 0 END,
                reset_failure_count = CASE WHEN ok THEN reset_failure_count ELSE 0 END,
                ok = TRUE,
                fail_notes = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("worker {}", id)))?;
        Ok(record.into())
    }

    async fn queue_build(&self, new: NewBuild) -> DbResult<Candidate> {
        let (processor, virtualized) = job_requirements(&new.spec);
        let job_type = new.spec.job_type();
        let spec = serde_json::to_value(&new.spec)?;

        let mut tx = self.pool.begin().await?;
        let build = sqlx::query_as::<_, BuildRecord>(
            "INSERT INTO builds (status, spec) VALUES ('NEEDSBUILD', $1) RETURNING *",
        )
        .bind(spec)
        .fetch_one(&mut *tx)
        .await?;
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (build_id, job_type, processor, virtualized, score, requesting_principal)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(build.id)
        .bind(job_type.as_str())
        .bind(processor)
        .bind(virtualized)
        .bind(new.score)
        .bind(new.requesting_principal)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Candidate {
            job: job.try_into()?,
            build: build.try_into()?,
        })
    }

    async fn candidates(&self, worker: &Worker) -> DbResult<Vec<Candidate>> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'waiting'
              AND claimed_by IS NULL
              AND (processor IS NULL OR processor = $1)
              AND (virtualized = $2 OR (virtualized IS NULL AND $2))
            ORDER BY score DESC, id ASC
            "#,
        )
        .bind(&worker.processor)
        .bind(worker.virtualized)
        .fetch_all(&self.pool)
        .await?;
        self.attach_builds(jobs).await
    }

    async fn try_claim(&self, job: JobId, worker: WorkerId) -> DbResult<Option<Candidate>> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = 'running', claimed_by = $2, date_started = NOW()
            WHERE id = $1 AND status = 'waiting' AND claimed_by IS NULL
            RETURNING *
            "#,
        )
        .bind(job.get())
        .bind(worker.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(claim_error(worker))?;

        let Some(claimed) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let build = sqlx::query_as::<_, BuildRecord>(
            r#"
            UPDATE builds
            SET status = 'BUILDING', builder = $2, date_started = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(claimed.build_id)
        .bind(worker.get())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(Candidate {
            job: claimed.try_into()?,
            build: build.try_into()?,
        }))
    }

    async fn release(&self, job: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let build_id: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'waiting', claimed_by = NULL, date_started = NULL, logtail = NULL
            WHERE id = $1
            RETURNING build_id
            "#,
        )
        .bind(job.get())
        .fetch_optional(&mut *tx)
        .await?;
        let build_id = build_id.ok_or_else(|| DbError::NotFound(format!("job {}", job)))?;

        sqlx::query(
            "UPDATE builds SET status = 'NEEDSBUILD', date_started = NULL WHERE id = $1",
        )
        .bind(build_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn finish(&self, job: JobId, status: JobStatus) -> DbResult<()> {
        let result = sqlx::query("UPDATE jobs SET status = $2, claimed_by = NULL WHERE id = $1")
            .bind(job.get())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job)));
        }
        Ok(())
    }

    async fn requeue(&self, build: BuildId, score: i32) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = 'waiting', claimed_by = NULL, score = $2, manual_score = FALSE,
                logtail = NULL, date_started = NULL
            WHERE build_id = $1
            RETURNING *
            "#,
        )
        .bind(build.get())
        .bind(score)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job for build {}", build)))?;
        record.try_into()
    }

    async fn rescore(&self, job: JobId, score: i32, manual: bool) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            "UPDATE jobs SET score = $2, manual_score = $3 WHERE id = $1 RETURNING *",
        )
        .bind(job.get())
        .bind(score)
        .bind(manual)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {}", job)))?;
        record.try_into()
    }

    async fn withdraw(&self, job: JobId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed'
            WHERE id = $1 AND status = 'waiting' AND claimed_by IS NULL
            "#,
        )
        .bind(job.get())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.get_job(job).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn job_for_build(&self, build: BuildId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE build_id = $1")
            .bind(build.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job for build {}", build)))?;
        record.try_into()
    }

    async fn save_job(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                score = $2, manual_score = $3, status = $4, claimed_by = $5,
                requesting_principal = $6, logtail = $7, date_started = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(job.score)
        .bind(job.manual_score)
        .bind(job.status.as_str())
        .bind(job.claimed_by.map(|w| w.get()))
        .bind(&job.requesting_principal)
        .bind(&job.logtail)
        .bind(job.date_started)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        record.try_into()
    }

    async fn save_build(&self, build: &Build) -> DbResult<()> {
        let log = build.log.as_ref().map(serde_json::to_value).transpose()?;
        let files = serde_json::to_value(&build.files)?;
        let spec = serde_json::to_value(&build.spec)?;

        let result = sqlx::query(
            r#"
            UPDATE builds SET
                status = $2, builder = $3, failure_count = $4, dependencies = $5,
                date_started = $6, date_finished = $7, log = $8, files = $9, spec = $10
            WHERE id = $1
            "#,
        )
        .bind(build.id.get())
        .bind(build.status.as_str())
        .bind(build.builder.map(|w| w.get()))
        .bind(to_i32(build.failure_count))
        .bind(&build.dependencies)
        .bind(build.date_started)
        .bind(build.date_finished)
        .bind(log)
        .bind(files)
        .bind(spec)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", build.id)));
        }
        Ok(())
    }

    async fn add_build_failure(&self, id: BuildId) -> DbResult<u32> {
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE builds SET failure_count = failure_count + 1 WHERE id = $1 RETURNING failure_count",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;
        let count = count.ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Ok(count.max(0) as u32)
    }

    async fn mark_cancelling(&self, id: BuildId) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'CANCELLING' WHERE id = $1 AND status = 'BUILDING'",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.get_build(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn current_job_for(&self, worker: WorkerId) -> DbResult<Option<Candidate>> {
        let jobs = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE claimed_by = $1")
            .bind(worker.get())
            .fetch_all(&self.pool)
            .await?;
        Ok(self.attach_builds(jobs).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_record(status: &str) -> JobRecord {
        JobRecord {
            id: 4,
            build_id: 3,
            job_type: "PACKAGEBUILD".to_string(),
            processor: None,
            virtualized: None,
            score: 2505,
            manual_score: false,
            status: status.to_string(),
            claimed_by: Some(1),
            requesting_principal: None,
            logtail: None,
            date_created: Utc::now(),
            date_started: None,
        }
    }

    #[test]
    fn test_job_record_conversion() {
        let job: Job = job_record("running").try_into().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.claimed_by, Some(WorkerId::new(1)));
        assert_eq!(job.build_id, BuildId::new(3));
    }

    #[test]
    fn test_corrupt_job_status_is_rejected() {
        let result: DbResult<Job> = job_record("exploded").try_into();
        assert!(matches!(result, Err(DbError::Serialization(_))));
    }

    #[test]
    fn test_worker_record_clamps_counters() {
        let worker: Worker = WorkerRecord {
            id: 1,
            name: "bob".to_string(),
            url: "http://bob:8221".to_string(),
            processor: "386".to_string(),
            virtualized: true,
            vm_host: None,
            ok: true,
            failure_count: -1,
            reset_failure_count: 2,
            manual: false,
            active: true,
            fail_notes: None,
        }
        .into();
        assert_eq!(worker.failure_count, 0);
        assert_eq!(worker.reset_failure_count, 2);
    }
}
