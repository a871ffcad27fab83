//! Live progress stream for one job
//!
//! Relays snapshots from the job's progress topic until one is terminal. The
//! channel is lossy, so whenever a wait times out the job record is checked and
//! the stream ends with the record's snapshot once the job has finished.

use catalog_common::ProgressSnapshot;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::import::progress::{ProgressChannel, ProgressSubscription};
use crate::import::store::JobStore;
use crate::import::{ImportError, ImportResult};

pub type SnapshotStream = BoxStream<'static, ProgressSnapshot>;

#[derive(Debug, Clone, Copy)]
pub struct StreamProgressQuery {
    pub job_id: Uuid,
    /// Longest wait on the channel before the job record is consulted
    pub poll_interval: Duration,
}

/// Open the stream, or fail with `JobNotFound` for an unknown job.
pub async fn handle(
    jobs: Arc<dyn JobStore>,
    channel: Arc<dyn ProgressChannel>,
    query: StreamProgressQuery,
) -> ImportResult<SnapshotStream> {
    let job = jobs
        .get(query.job_id)
        .await?
        .ok_or(ImportError::JobNotFound(query.job_id))?;
    if job.status.is_terminal() {
        return Ok(stream::once(async move { job.snapshot() }).boxed());
    }

    let subscription = match channel.subscribe(query.job_id).await {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            warn!(job_id = %query.job_id, error = %e, "Progress subscribe failed, polling job record");
            None
        },
    };

    // The job may have finished between the first read and the subscribe
    if let Some(job) = jobs.get(query.job_id).await? {
        if job.status.is_terminal() {
            return Ok(stream::once(async move { job.snapshot() }).boxed());
        }
    }

    let relay = Relay {
        jobs,
        subscription,
        job_id: query.job_id,
        poll_interval: query.poll_interval,
    };

    Ok(stream::unfold(Some(relay), |state| async move {
        let mut relay = state?;
        let snapshot = relay.next().await?;
        let next = if snapshot.is_terminal() { None } else { Some(relay) };
        Some((snapshot, next))
    })
    .boxed())
}

struct Relay {
    jobs: Arc<dyn JobStore>,
    subscription: Option<Box<dyn ProgressSubscription>>,
    job_id: Uuid,
    poll_interval: Duration,
}

impl Relay {
    /// Next snapshot to send, or `None` when the stream should end without one.
    async fn next(&mut self) -> Option<ProgressSnapshot> {
        loop {
            match self.subscription.as_mut() {
                Some(subscription) => match subscription.recv_timeout(self.poll_interval).await {
                    Ok(Some(snapshot)) => return Some(snapshot),
                    Ok(None) => {},
                    Err(e) => {
                        warn!(job_id = %self.job_id, error = %e, "Progress subscription failed, polling job record");
                        self.subscription = None;
                    },
                },
                None => tokio::time::sleep(self.poll_interval).await,
            }

            match self.jobs.get(self.job_id).await {
                Ok(Some(job)) if job.status.is_terminal() => {
                    debug!(job_id = %self.job_id, status = %job.status, "Job finished while waiting");
                    return Some(job.snapshot());
                },
                Ok(Some(_)) => {},
                Ok(None) => {
                    warn!(job_id = %self.job_id, "Job disappeared while streaming");
                    return None;
                },
                Err(e) => warn!(job_id = %self.job_id, error = %e, "Job poll failed"),
            }
        }
    }
}
