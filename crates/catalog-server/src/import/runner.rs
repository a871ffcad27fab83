//! Job runner: one import, start to finish
//!
//! ```text
//! uploaded ──claim──> processing ──ok──> completed
//!                         │
//!                         └──err──> failed
//! ```
//!
//! The staged source is released on every exit path.

use catalog_common::JobStatus;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::batcher::batches;
use super::jobs::{ImportCounters, ImportOutcome, ImportSummary, ImportTask, Job};
use super::notifier::{LifecycleNotifier, WebhookEvent};
use super::parser::{count_rows, parse_rows};
use super::progress::{ProgressChannel, ProgressReporter};
use super::source::DataSource;
use super::store::{Claim, JobStore};
use super::upsert::{CatalogStore, UpsertEngine};
use super::{ImportError, ImportResult};
use crate::config::ImportConfig;

/// Collaborators shared by every run
#[derive(Clone)]
pub struct ImportContext {
    pub jobs: Arc<dyn JobStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub sources: Arc<dyn DataSource>,
    pub channel: Arc<dyn ProgressChannel>,
    pub notifier: Arc<dyn LifecycleNotifier>,
}

pub struct ImportRunner {
    jobs: Arc<dyn JobStore>,
    sources: Arc<dyn DataSource>,
    notifier: Arc<dyn LifecycleNotifier>,
    engine: UpsertEngine,
    reporter: ProgressReporter,
    batch_size: usize,
    heartbeat_interval: Duration,
    lease: Duration,
    worker: String,
}

impl ImportRunner {
    pub fn new(ctx: ImportContext, config: &ImportConfig) -> Self {
        let reporter = ProgressReporter::new(
            ctx.jobs.clone(),
            ctx.channel.clone(),
            config.publish_timeout(),
        );

        Self {
            jobs: ctx.jobs,
            sources: ctx.sources,
            notifier: ctx.notifier,
            engine: UpsertEngine::new(ctx.catalog),
            reporter,
            batch_size: config.batch_size,
            heartbeat_interval: config.heartbeat_interval(),
            lease: config.lease_timeout(),
            worker: worker_name(),
        }
    }

    /// Host and process of this runner. Each run holds its lease under this
    /// prefix plus a run id.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Run one delivered task.
    ///
    /// Errors are recorded on the job before they are returned.
    #[instrument(skip_all, fields(job_id = %task.job_id, source = %task.source))]
    pub async fn run(&self, task: &ImportTask) -> ImportResult<ImportOutcome> {
        let worker = format!("{}:{}", self.worker, Uuid::new_v4().simple());
        let job = match self.jobs.claim(task.job_id, &worker, self.lease).await? {
            Claim::Claimed(job) => job,
            Claim::Unclaimable(job) => {
                info!(status = %job.status, "Job not claimable, skipping delivery");
                if job.status.is_terminal() {
                    self.release(task).await;
                }
                return Ok(ImportOutcome::Skipped { status: job.status });
            },
        };

        info!(filename = %job.filename, worker = %worker, "Import started");
        self.notifier
            .notify(WebhookEvent::ImportStarted {
                job_id: job.id,
                filename: job.filename.clone(),
            })
            .await;

        let mut counters = ImportCounters::default();
        let heartbeat = HeartbeatGuard::spawn(
            self.jobs.clone(),
            job.id,
            worker.clone(),
            self.heartbeat_interval,
        );
        let result = self.process(&job, &worker, task, &mut counters).await;
        drop(heartbeat);

        let outcome = match result {
            Ok(summary) => {
                self.finish(&job, &summary).await;
                Ok(ImportOutcome::Completed(summary))
            },
            Err(e) => {
                self.abort(&job, &worker, counters, &e).await;
                Err(e)
            },
        };

        self.release(task).await;
        outcome
    }

    async fn process(
        &self,
        job: &Job,
        worker: &str,
        task: &ImportTask,
        counters: &mut ImportCounters,
    ) -> ImportResult<ImportSummary> {
        let total = count_rows(self.sources.open(&task.source).await?).await? as i64;
        self.jobs.set_total_rows(job.id, worker, total).await?;
        debug!(total, "Counted source rows");

        let rows = parse_rows(self.sources.open(&task.source).await?).await?;
        let mut batches = batches(rows, self.batch_size);
        let mut applied = 0usize;

        while let Some(batch) = batches.next().await {
            let batch = batch?;
            let outcome = self.engine.apply(batch).await?;

            counters.add(outcome.created, outcome.updated);
            applied += 1;
            self.reporter
                .checkpoint(job.id, worker, total, *counters)
                .await?;

            debug!(
                batch = applied,
                created = outcome.created,
                updated = outcome.updated,
                processed = counters.processed,
                "Batch committed"
            );
        }

        let completed = self.jobs.complete(job.id, worker, *counters).await?;

        Ok(ImportSummary {
            job_id: completed.id,
            total_rows: total,
            processed: counters.processed,
            created: counters.created,
            updated: counters.updated,
            batches: applied,
        })
    }

    async fn finish(&self, job: &Job, summary: &ImportSummary) {
        info!(
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            batches = summary.batches,
            "Import completed"
        );

        let counters = ImportCounters {
            processed: summary.processed,
            created: summary.created,
            updated: summary.updated,
        };
        // Final snapshot reports processed == total
        self.reporter
            .publish(counters.snapshot(job.id, JobStatus::Completed, summary.processed))
            .await;

        self.notifier
            .notify(WebhookEvent::ImportCompleted {
                job_id: job.id,
                filename: job.filename.clone(),
                total_rows: summary.total_rows,
                created: summary.created,
                updated: summary.updated,
            })
            .await;
    }

    async fn abort(&self, job: &Job, worker: &str, counters: ImportCounters, cause: &ImportError) {
        let message = cause.to_string();
        error!(error = %message, processed = counters.processed, "Import failed");

        match self.jobs.fail_held(job.id, worker, &message).await {
            Ok(Some(failed)) => {
                let mut snapshot =
                    failed
                        .counters()
                        .snapshot(job.id, JobStatus::Failed, failed.total_rows);
                snapshot.error = Some(message.clone());
                self.reporter.publish(snapshot).await;

                self.notifier
                    .notify(WebhookEvent::ImportFailed {
                        job_id: job.id,
                        error: message,
                    })
                    .await;
            },
            Ok(None) => warn!("Lease no longer held, failure not recorded"),
            Err(e) => error!(error = %e, "Failed to record job failure"),
        }
    }

    async fn release(&self, task: &ImportTask) {
        if let Err(e) = self.sources.release(&task.source).await {
            warn!(error = %e, "Failed to release staged source");
        }
    }
}

/// Refreshes the job lease until dropped.
struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    fn spawn(jobs: Arc<dyn JobStore>, job_id: Uuid, worker: String, every: Duration) -> Self {
        let task = async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the claim already set the lease
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = jobs.heartbeat(job_id, &worker).await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        };

        Self {
            handle: tokio::spawn(task.in_current_span()),
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn worker_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_name_includes_pid() {
        let name = worker_name();
        assert!(name.ends_with(&format!(":{}", std::process::id())));
    }
}
