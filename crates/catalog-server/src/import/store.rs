//! Durable job records
//!
//! The job row is the source of truth for an import's status and counters.
//! Every mutation after the hand-off to a worker is guarded on the current
//! status and the lease holder in `worker_hostname`, so a runner that lost its
//! lease cannot overwrite a record another runner or the reaper now owns.

use async_trait::async_trait;
use catalog_common::JobStatus;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use super::jobs::{ImportCounters, Job, NewJob};
use super::source::SourceLocator;
use super::{ImportError, ImportResult};

/// Result of trying to take ownership of a job
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The job is now `processing` with counters reset to zero
    Claimed(Job),
    /// The job is terminal, not yet uploaded, or held under a live lease
    Unclaimable(Job),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: NewJob) -> ImportResult<Job>;

    async fn get(&self, id: Uuid) -> ImportResult<Option<Job>>;

    async fn delete(&self, id: Uuid) -> ImportResult<()>;

    /// `pending`/`uploading` -> `uploaded`, recording where the file landed.
    async fn mark_uploaded(&self, id: Uuid, source: &SourceLocator) -> ImportResult<Job>;

    /// `uploaded` -> `pending`, keeping the recorded source.
    async fn reopen_upload(&self, id: Uuid) -> ImportResult<()>;

    /// `uploaded` -> `processing` for `worker`. A `processing` job is only
    /// taken over once its lease is older than `lease`.
    async fn claim(&self, id: Uuid, worker: &str, lease: Duration) -> ImportResult<Claim>;

    async fn set_total_rows(&self, id: Uuid, worker: &str, total: i64) -> ImportResult<()>;

    /// Persist running counters and refresh the lease.
    async fn checkpoint(
        &self,
        id: Uuid,
        worker: &str,
        counters: ImportCounters,
    ) -> ImportResult<()>;

    /// `processing` -> `completed` with the final counters.
    async fn complete(&self, id: Uuid, worker: &str, counters: ImportCounters) -> ImportResult<Job>;

    /// Any non-terminal state -> `failed`. Returns `None` when the job was
    /// already terminal.
    async fn fail(&self, id: Uuid, message: &str) -> ImportResult<Option<Job>>;

    /// `processing` -> `failed`, only while `worker` still holds the lease.
    async fn fail_held(&self, id: Uuid, worker: &str, message: &str) -> ImportResult<Option<Job>>;

    async fn heartbeat(&self, id: Uuid, worker: &str) -> ImportResult<()>;

    /// Fail every `processing` job whose lease is older than `lease`.
    async fn fail_stale(&self, lease: Duration, message: &str) -> ImportResult<Vec<Job>>;
}

fn lease_lost(id: Uuid) -> ImportError {
    ImportError::InvalidState(format!("job {} is no longer processing on this worker", id))
}

/// Postgres-backed job store over `upload_jobs`
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn require(&self, id: Uuid) -> ImportResult<Job> {
        self.get(id).await?.ok_or(ImportError::JobNotFound(id))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: NewJob) -> ImportResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO upload_jobs (id, filename, status, source)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.filename)
        .bind(job.status.as_str())
        .bind(job.source.map(Json))
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, id: Uuid) -> ImportResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM upload_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn delete(&self, id: Uuid) -> ImportResult<()> {
        sqlx::query("DELETE FROM upload_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_uploaded(&self, id: Uuid, source: &SourceLocator) -> ImportResult<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'uploaded', source = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'uploading')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(source))
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => {
                let current = self.require(id).await?;
                Err(ImportError::InvalidState(format!(
                    "job {} is {} and cannot be marked uploaded",
                    id, current.status
                )))
            },
        }
    }

    async fn reopen_upload(&self, id: Uuid) -> ImportResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET status = 'pending', updated_at = NOW()
            WHERE id = $1 AND status = 'uploaded'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.require(id).await?;
            return Err(ImportError::InvalidState(format!(
                "job {} is {} and cannot be reopened",
                id, current.status
            )));
        }
        Ok(())
    }

    async fn claim(&self, id: Uuid, worker: &str, lease: Duration) -> ImportResult<Claim> {
        let claimed = sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'processing',
                processed_rows = 0,
                created_rows = 0,
                updated_rows = 0,
                error_message = NULL,
                worker_hostname = $2,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND (status = 'uploaded'
                   OR (status = 'processing'
                       AND COALESCE(heartbeat_at, updated_at) < NOW() - make_interval(secs => $3)))
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(job) => Ok(Claim::Claimed(job)),
            None => Ok(Claim::Unclaimable(self.require(id).await?)),
        }
    }

    async fn set_total_rows(&self, id: Uuid, worker: &str, total: i64) -> ImportResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET total_rows = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND worker_hostname = $2
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(total)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(id));
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        worker: &str,
        counters: ImportCounters,
    ) -> ImportResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET processed_rows = $3,
                created_rows = $4,
                updated_rows = $5,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND worker_hostname = $2
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(counters.processed)
        .bind(counters.created)
        .bind(counters.updated)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        worker: &str,
        counters: ImportCounters,
    ) -> ImportResult<Job> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'completed',
                processed_rows = $3,
                created_rows = $4,
                updated_rows = $5,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND worker_hostname = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(counters.processed)
        .bind(counters.created)
        .bind(counters.updated)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| lease_lost(id))
    }

    async fn fail(&self, id: Uuid, message: &str) -> ImportResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'failed',
                error_message = $2,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn fail_held(
        &self,
        id: Uuid,
        worker: &str,
        message: &str,
    ) -> ImportResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'failed',
                error_message = $3,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND worker_hostname = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn heartbeat(&self, id: Uuid, worker: &str) -> ImportResult<()> {
        sqlx::query(
            r#"
            UPDATE upload_jobs
            SET heartbeat_at = NOW()
            WHERE id = $1 AND status = 'processing' AND worker_hostname = $2
            "#,
        )
        .bind(id)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_stale(&self, lease: Duration, message: &str) -> ImportResult<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            UPDATE upload_jobs
            SET status = 'failed',
                error_message = $1,
                heartbeat_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND COALESCE(heartbeat_at, updated_at) < NOW() - make_interval(secs => $2)
            RETURNING *
            "#,
        )
        .bind(message)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

impl Claim {
    pub fn status(&self) -> JobStatus {
        match self {
            Claim::Claimed(job) | Claim::Unclaimable(job) => job.status,
        }
    }
}
