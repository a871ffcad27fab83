//! Hand-off from uploads to import workers
//!
//! Two backends share the [`TaskQueue`] seam:
//! - [`ApalisQueue`]: durable Postgres queue consumed by [`ImportWorker`]s,
//!   possibly in other processes
//! - [`LocalQueue`]: runs imports on the current tokio runtime

use apalis::prelude::*;
use apalis_postgres::PostgresStorage;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

use super::jobs::{ImportOutcome, ImportTask};
use super::runner::ImportRunner;
use super::{ImportError, ImportResult};

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule one runner invocation. Delivery is at-least-once.
    async fn enqueue(&self, task: ImportTask) -> ImportResult<()>;
}

// ============================================================================
// In-process queue
// ============================================================================

/// Spawns each task on the runtime, at most `concurrency` at a time.
#[derive(Clone)]
pub struct LocalQueue {
    runner: Arc<ImportRunner>,
    permits: Arc<Semaphore>,
}

impl LocalQueue {
    pub fn new(runner: Arc<ImportRunner>, concurrency: usize) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, task: ImportTask) -> ImportResult<()> {
        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let span = info_span!("local_import", job_id = %task.job_id);

        tokio::spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    error!("Import semaphore closed, task dropped");
                    return;
                };
                // Failures are already recorded on the job
                let _ = runner.run(&task).await;
            }
            .instrument(span),
        );

        Ok(())
    }
}

// ============================================================================
// Apalis queue
// ============================================================================

/// Create the apalis job tables if they do not exist.
pub async fn setup_apalis(pool: &PgPool) -> ImportResult<()> {
    PostgresStorage::setup(pool)
        .await
        .map_err(|e| ImportError::Queue(format!("apalis setup failed: {}", e)))
}

/// Producer side of the durable queue
#[derive(Clone)]
pub struct ApalisQueue {
    storage: PostgresStorage<ImportTask>,
}

impl ApalisQueue {
    pub fn new(pool: &PgPool) -> Self {
        Self {
            storage: PostgresStorage::new(pool),
        }
    }
}

#[async_trait]
impl TaskQueue for ApalisQueue {
    async fn enqueue(&self, task: ImportTask) -> ImportResult<()> {
        let job_id = task.job_id;
        let mut storage = self.storage.clone();
        storage
            .push(task)
            .await
            .map_err(|e| ImportError::Queue(e.to_string()))?;

        info!(%job_id, "Import task enqueued");
        Ok(())
    }
}

/// Apalis handler for one delivered [`ImportTask`].
///
/// Returning the error lets apalis record the attempt as failed.
pub async fn process_import_task(
    task: ImportTask,
    runner: Data<Arc<ImportRunner>>,
) -> Result<(), ImportError> {
    match runner.run(&task).await? {
        ImportOutcome::Completed(summary) => {
            info!(job_id = %summary.job_id, processed = summary.processed, "Import task done");
        },
        ImportOutcome::Skipped { status } => {
            info!(job_id = %task.job_id, %status, "Import task skipped");
        },
    }
    Ok(())
}

/// Consumer side of the durable queue
pub struct ImportWorker {
    pool: PgPool,
    runner: Arc<ImportRunner>,
    concurrency: usize,
}

impl ImportWorker {
    pub fn new(pool: PgPool, runner: Arc<ImportRunner>, concurrency: usize) -> Self {
        Self {
            pool,
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Register the workers on an apalis monitor and run it in the background.
    pub fn start(self) -> JoinHandle<()> {
        let storage: PostgresStorage<ImportTask> = PostgresStorage::new(&self.pool);
        let concurrency = self.concurrency;
        let runner = self.runner;

        tokio::spawn(async move {
            info!(concurrency, "Import workers started");

            let mut monitor = Monitor::new();
            for index in 0..concurrency {
                let storage = storage.clone();
                let runner = runner.clone();
                monitor = monitor.register(move |_| {
                    WorkerBuilder::new(format!("catalog-import-{}", index))
                        .backend(storage.clone())
                        .data(runner.clone())
                        .build(process_import_task)
                });
            }

            if let Err(e) = monitor.run().await {
                error!("Import worker monitor error: {:?}", e);
            }
            info!("Import workers stopped");
        })
    }
}
