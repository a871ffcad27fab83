//! Stale-job recovery
//!
//! A runner that crashes leaves its job in `processing` with a heartbeat that
//! stops advancing. The reaper fails such jobs once the heartbeat is older
//! than the lease timeout.

use catalog_common::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::jobs::Job;
use super::notifier::{LifecycleNotifier, WebhookEvent};
use super::progress::ProgressReporter;
use super::store::JobStore;
use super::ImportResult;

pub const LEASE_EXPIRED_MESSAGE: &str = "worker lease expired";

pub struct LeaseReaper {
    jobs: Arc<dyn JobStore>,
    reporter: ProgressReporter,
    notifier: Arc<dyn LifecycleNotifier>,
    lease_timeout: Duration,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        reporter: ProgressReporter,
        notifier: Arc<dyn LifecycleNotifier>,
        lease_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            reporter,
            notifier,
            lease_timeout,
            interval,
        }
    }

    /// Fail every expired job once. Returns the jobs that were failed.
    pub async fn reap_once(&self) -> ImportResult<Vec<Job>> {
        let expired = self
            .jobs
            .fail_stale(self.lease_timeout, LEASE_EXPIRED_MESSAGE)
            .await?;

        for job in &expired {
            warn!(
                job_id = %job.id,
                worker = job.worker_hostname.as_deref().unwrap_or("unknown"),
                processed = job.processed_rows,
                "Job lease expired, marked failed"
            );

            let mut snapshot = job
                .counters()
                .snapshot(job.id, JobStatus::Failed, job.total_rows);
            snapshot.error = Some(LEASE_EXPIRED_MESSAGE.to_string());
            self.reporter.publish(snapshot).await;

            self.notifier
                .notify(WebhookEvent::ImportFailed {
                    job_id: job.id,
                    error: LEASE_EXPIRED_MESSAGE.to_string(),
                })
                .await;
        }

        Ok(expired)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                lease_secs = self.lease_timeout.as_secs(),
                interval_secs = self.interval.as_secs(),
                "Lease reaper started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_once().await {
                    error!(error = %e, "Lease reaper pass failed");
                }
            }
        })
    }
}
