//! Common test utilities for catalog server integration tests
//!
//! - In-memory [`JobStore`] and [`CatalogStore`] with the same status guards
//!   and key semantics as the Postgres implementations
//! - A recording webhook notifier and a progress channel that always fails
//! - [`Harness`]: a runner wired to the in-memory stores with staged CSVs in a
//!   temporary directory
//! - [`TestPostgres`]: PostgreSQL container with migrations applied (Docker)

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use catalog_common::{JobStatus, ProgressSnapshot};
use catalog_server::config::ImportConfig;
use catalog_server::import::notifier::{LifecycleNotifier, WebhookEvent};
use catalog_server::import::parser::RowRecord;
use catalog_server::import::progress::{
    BroadcastChannel, ProgressChannel, ProgressError, ProgressSubscription,
};
use catalog_server::import::source::{SourceLocator, StagedSources};
use catalog_server::import::store::{Claim, JobStore};
use catalog_server::import::upsert::CatalogStore;
use catalog_server::import::{
    ImportContext, ImportCounters, ImportError, ImportResult, ImportRunner, ImportTask, Job,
    NewJob,
};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

// ============================================================================
// In-memory job store
// ============================================================================

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    checkpoints: Mutex<Vec<(Uuid, ImportCounters)>>,
    heartbeats: AtomicUsize,
}

fn lease_lost(id: Uuid) -> ImportError {
    ImportError::InvalidState(format!("job {} is no longer processing on this worker", id))
}

fn holds_lease(job: &Job, worker: &str) -> bool {
    job.status == JobStatus::Processing && job.worker_hostname.as_deref() == Some(worker)
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.jobs.lock().unwrap()[&id].clone()
    }

    pub fn checkpoints(&self, id: Uuid) -> Vec<ImportCounters> {
        self.checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, _)| *job_id == id)
            .map(|(_, counters)| *counters)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().unwrap().is_empty()
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Overwrite fields directly, bypassing the status guards.
    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Job)) {
        let mut jobs = self.jobs.lock().unwrap();
        f(jobs.get_mut(&id).unwrap());
    }

    fn with_lease<T>(
        &self,
        id: Uuid,
        worker: &str,
        f: impl FnOnce(&mut Job) -> T,
    ) -> ImportResult<T> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if holds_lease(job, worker) => {
                job.updated_at = Utc::now();
                Ok(f(job))
            },
            Some(_) => Err(lease_lost(id)),
            None => Err(ImportError::JobNotFound(id)),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> ImportResult<Job> {
        let job = Job::new(new);
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(ImportError::InvalidState(format!("job {} exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> ImportResult<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> ImportResult<()> {
        self.jobs.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn mark_uploaded(&self, id: Uuid, source: &SourceLocator) -> ImportResult<Job> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(ImportError::JobNotFound(id))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
            return Err(ImportError::InvalidState(format!(
                "job {} is {} and cannot be marked uploaded",
                id, job.status
            )));
        }
        job.status = JobStatus::Uploaded;
        job.source = Some(Json(source.clone()));
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reopen_upload(&self, id: Uuid) -> ImportResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(ImportError::JobNotFound(id))?;
        if job.status != JobStatus::Uploaded {
            return Err(ImportError::InvalidState(format!(
                "job {} is {} and cannot be reopened",
                id, job.status
            )));
        }
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn claim(&self, id: Uuid, worker: &str, lease: Duration) -> ImportResult<Claim> {
        let cutoff = Utc::now() - chrono::Duration::from_std(lease).unwrap();
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or(ImportError::JobNotFound(id))?;
        let expired = job.heartbeat_at.unwrap_or(job.updated_at) < cutoff;
        let claimable = match job.status {
            JobStatus::Uploaded => true,
            JobStatus::Processing => expired,
            _ => false,
        };
        if !claimable {
            return Ok(Claim::Unclaimable(job.clone()));
        }
        job.status = JobStatus::Processing;
        job.processed_rows = 0;
        job.created_rows = 0;
        job.updated_rows = 0;
        job.error_message = None;
        job.worker_hostname = Some(worker.to_string());
        job.heartbeat_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(Claim::Claimed(job.clone()))
    }

    async fn set_total_rows(&self, id: Uuid, worker: &str, total: i64) -> ImportResult<()> {
        self.with_lease(id, worker, |job| job.total_rows = total)
    }

    async fn checkpoint(
        &self,
        id: Uuid,
        worker: &str,
        counters: ImportCounters,
    ) -> ImportResult<()> {
        self.with_lease(id, worker, |job| {
            job.processed_rows = counters.processed;
            job.created_rows = counters.created;
            job.updated_rows = counters.updated;
            job.heartbeat_at = Some(Utc::now());
        })?;
        self.checkpoints.lock().unwrap().push((id, counters));
        Ok(())
    }

    async fn complete(&self, id: Uuid, worker: &str, counters: ImportCounters) -> ImportResult<Job> {
        self.with_lease(id, worker, |job| {
            job.status = JobStatus::Completed;
            job.processed_rows = counters.processed;
            job.created_rows = counters.created;
            job.updated_rows = counters.updated;
            job.heartbeat_at = None;
            job.clone()
        })
    }

    async fn fail(&self, id: Uuid, message: &str) -> ImportResult<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.heartbeat_at = None;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            },
            _ => Ok(None),
        }
    }

    async fn fail_held(
        &self,
        id: Uuid,
        worker: &str,
        message: &str,
    ) -> ImportResult<Option<Job>> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if holds_lease(job, worker) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.heartbeat_at = None;
                job.updated_at = Utc::now();
                Ok(Some(job.clone()))
            },
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, id: Uuid, worker: &str) -> ImportResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&id) {
            if holds_lease(job, worker) {
                job.heartbeat_at = Some(Utc::now());
                self.heartbeats.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn fail_stale(&self, lease: Duration, message: &str) -> ImportResult<Vec<Job>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(lease).unwrap();
        let mut jobs = self.jobs.lock().unwrap();
        let mut failed = Vec::new();
        for job in jobs.values_mut() {
            let last_seen = job.heartbeat_at.unwrap_or(job.updated_at);
            if job.status == JobStatus::Processing && last_seen < cutoff {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.heartbeat_at = None;
                job.updated_at = Utc::now();
                failed.push(job.clone());
            }
        }
        Ok(failed)
    }
}

// ============================================================================
// In-memory catalog
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProduct {
    pub name: String,
    pub description: Option<String>,
}

/// Catalog keyed by the normalized sku, optionally failing on the n-th batch
#[derive(Default)]
pub struct MemoryCatalog {
    products: Mutex<HashMap<String, StoredProduct>>,
    batch_sizes: Mutex<Vec<usize>>,
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th upsert (1-based) without writing anything.
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    pub fn product(&self, sku: &str) -> Option<StoredProduct> {
        self.products.lock().unwrap().get(&sku.to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.products.lock().unwrap().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn upsert_batch(&self, rows: &[RowRecord]) -> ImportResult<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(ImportError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut products = self.products.lock().unwrap();
        let existing = rows
            .iter()
            .filter(|row| products.contains_key(&row.sku.to_lowercase()))
            .count();
        for row in rows {
            products.insert(
                row.sku.to_lowercase(),
                StoredProduct {
                    name: row.name.clone(),
                    description: row.description.clone(),
                },
            );
        }
        self.batch_sizes.lock().unwrap().push(rows.len());

        Ok(existing as u64)
    }
}

// ============================================================================
// Notifier and channels
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<WebhookEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(WebhookEvent::name).collect()
    }
}

#[async_trait]
impl LifecycleNotifier for RecordingNotifier {
    async fn notify(&self, event: WebhookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Channel whose broker is always unreachable
pub struct UnavailableChannel;

#[async_trait]
impl ProgressChannel for UnavailableChannel {
    async fn publish(&self, _snapshot: &ProgressSnapshot) -> Result<(), ProgressError> {
        Err(ProgressError::Unavailable("connection refused".into()))
    }

    async fn subscribe(
        &self,
        _job_id: Uuid,
    ) -> Result<Box<dyn ProgressSubscription>, ProgressError> {
        Err(ProgressError::Unavailable("connection refused".into()))
    }
}

/// Read every snapshot already buffered on `subscription`.
pub async fn drain(subscription: &mut Box<dyn ProgressSubscription>) -> Vec<ProgressSnapshot> {
    let mut snapshots = Vec::new();
    while let Ok(Some(snapshot)) = subscription.recv_timeout(Duration::from_millis(50)).await {
        snapshots.push(snapshot);
    }
    snapshots
}

// ============================================================================
// CSV fixtures
// ============================================================================

/// `sku,name,description` CSV with `count` rows named `SKU-<i>`.
pub fn catalog_csv(count: usize, name_prefix: &str) -> String {
    let mut csv = String::from("sku,name,description\n");
    for i in 0..count {
        csv.push_str(&format!("SKU-{},{} {},Item {}\n", i, name_prefix, i, i));
    }
    csv
}

// ============================================================================
// Runner harness
// ============================================================================

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub notifier: Arc<RecordingNotifier>,
    pub channel: Arc<dyn ProgressChannel>,
    pub runner: ImportRunner,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_catalog(MemoryCatalog::new())
    }

    pub fn with_catalog(catalog: MemoryCatalog) -> Self {
        Self::build(catalog, Arc::new(BroadcastChannel::new()))
    }

    pub fn with_channel(channel: Arc<dyn ProgressChannel>) -> Self {
        Self::build(MemoryCatalog::new(), channel)
    }

    fn build(catalog: MemoryCatalog, channel: Arc<dyn ProgressChannel>) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let catalog = Arc::new(catalog);
        let notifier = Arc::new(RecordingNotifier::default());

        let ctx = ImportContext {
            jobs: jobs.clone(),
            catalog: catalog.clone(),
            sources: Arc::new(StagedSources::local_only()),
            channel: channel.clone(),
            notifier: notifier.clone(),
        };
        let config = ImportConfig {
            publish_timeout_ms: 100,
            ..ImportConfig::default()
        };

        Self {
            jobs,
            catalog,
            notifier,
            channel,
            runner: ImportRunner::new(ctx, &config),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Write `csv` to a staged file and create an `uploaded` job for it.
    pub async fn stage(&self, csv: &str) -> ImportTask {
        let job_id = Uuid::new_v4();
        let path = self.staged_path(job_id);
        tokio::fs::write(&path, csv).await.unwrap();

        let source = SourceLocator::Local { path };
        self.jobs
            .create(
                NewJob::new(job_id, "catalog.csv", JobStatus::Uploaded).with_source(source.clone()),
            )
            .await
            .unwrap();

        ImportTask::new(job_id, source)
    }

    pub fn staged_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.path().join(format!("{}.csv", job_id))
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
            .await
            .context("Failed to connect to PostgreSQL")?;

        catalog_server::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
