//! Live progress channel and reporter
//!
//! Each job has an ephemeral topic (`upload:<job_id>`). The runner publishes a
//! [`ProgressSnapshot`] after every checkpoint; any number of gateways relay
//! them to viewers. Publishing is best-effort: the job record stays the
//! durable source of truth.

use async_trait::async_trait;
use catalog_common::ProgressSnapshot;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{trace, warn};
use uuid::Uuid;

use super::jobs::ImportCounters;
use super::store::JobStore;
use super::ImportResult;

/// Buffered snapshots per in-process subscriber before it starts lagging
const BROADCAST_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Progress channel unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed progress message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Progress subscription closed")]
    Closed,
}

impl From<sqlx::Error> for ProgressError {
    fn from(err: sqlx::Error) -> Self {
        ProgressError::Unavailable(err.to_string())
    }
}

/// Topic name for a job's progress.
pub fn topic(job_id: Uuid) -> String {
    format!("upload:{}", job_id)
}

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    async fn publish(&self, snapshot: &ProgressSnapshot) -> Result<(), ProgressError>;

    async fn subscribe(&self, job_id: Uuid) -> Result<Box<dyn ProgressSubscription>, ProgressError>;
}

#[async_trait]
pub trait ProgressSubscription: Send {
    /// Wait up to `wait` for the next snapshot. `Ok(None)` means the wait
    /// elapsed with nothing received.
    async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<ProgressSnapshot>, ProgressError>;
}

// ============================================================================
// Postgres LISTEN/NOTIFY
// ============================================================================

/// Cross-process channel over Postgres `NOTIFY`
#[derive(Clone)]
pub struct PgNotifyChannel {
    pool: PgPool,
}

impl PgNotifyChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressChannel for PgNotifyChannel {
    async fn publish(&self, snapshot: &ProgressSnapshot) -> Result<(), ProgressError> {
        let payload = serde_json::to_string(snapshot)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic(snapshot.job_id))
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<Box<dyn ProgressSubscription>, ProgressError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&topic(job_id)).await?;

        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl ProgressSubscription for PgSubscription {
    async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<ProgressSnapshot>, ProgressError> {
        match tokio::time::timeout(wait, self.listener.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(notification)) => Ok(Some(serde_json::from_str(notification.payload())?)),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-process broadcast
// ============================================================================

/// Single-process channel over `tokio::sync::broadcast`
///
/// Topics are created on first subscribe and dropped after a terminal
/// snapshot or when their last subscriber goes away. Snapshots published with
/// no subscriber are discarded.
#[derive(Clone, Default)]
pub struct BroadcastChannel {
    topics: Arc<Mutex<Topics>>,
}

type Topics = HashMap<Uuid, broadcast::Sender<ProgressSnapshot>>;

fn lock(topics: &Mutex<Topics>) -> MutexGuard<'_, Topics> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BroadcastChannel {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }
}

#[async_trait]
impl ProgressChannel for BroadcastChannel {
    async fn publish(&self, snapshot: &ProgressSnapshot) -> Result<(), ProgressError> {
        let mut topics = lock(&self.topics);

        if let Some(sender) = topics.get(&snapshot.job_id) {
            // Err only means every receiver is gone
            let _ = sender.send(snapshot.clone());
        }
        if snapshot.is_terminal() {
            topics.remove(&snapshot.job_id);
        }

        Ok(())
    }

    async fn subscribe(&self, job_id: Uuid) -> Result<Box<dyn ProgressSubscription>, ProgressError> {
        let mut topics = lock(&self.topics);
        let receiver = topics
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe();

        Ok(Box::new(BroadcastSubscription {
            receiver,
            _topic: TopicGuard {
                topics: self.topics.clone(),
                job_id,
            },
        }))
    }
}

// Fields drop in order, so the receiver is gone before the guard runs.
struct BroadcastSubscription {
    receiver: broadcast::Receiver<ProgressSnapshot>,
    _topic: TopicGuard,
}

/// Removes the job's topic once no receiver is left on it.
struct TopicGuard {
    topics: Arc<Mutex<Topics>>,
    job_id: Uuid,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        let mut topics = lock(&self.topics);
        if topics
            .get(&self.job_id)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            topics.remove(&self.job_id);
        }
    }
}

#[async_trait]
impl ProgressSubscription for BroadcastSubscription {
    async fn recv_timeout(&mut self, wait: Duration) -> Result<Option<ProgressSnapshot>, ProgressError> {
        let receiver = &mut self.receiver;
        let next = async {
            loop {
                match receiver.recv().await {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Progress subscriber lagged, snapshots dropped");
                    },
                    Err(broadcast::error::RecvError::Closed) => return Err(ProgressError::Closed),
                }
            }
        };

        match tokio::time::timeout(wait, next).await {
            Err(_) => Ok(None),
            Ok(result) => result.map(Some),
        }
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Persists checkpoints and publishes snapshots for the runner.
#[derive(Clone)]
pub struct ProgressReporter {
    jobs: Arc<dyn JobStore>,
    channel: Arc<dyn ProgressChannel>,
    publish_timeout: Duration,
}

impl ProgressReporter {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        channel: Arc<dyn ProgressChannel>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            channel,
            publish_timeout,
        }
    }

    /// Persist `counters` and broadcast a `processing` snapshot.
    ///
    /// Persistence failures propagate; publish failures do not.
    pub async fn checkpoint(
        &self,
        job_id: Uuid,
        worker: &str,
        total: i64,
        counters: ImportCounters,
    ) -> ImportResult<()> {
        self.jobs.checkpoint(job_id, worker, counters).await?;
        self.publish(counters.snapshot(job_id, catalog_common::JobStatus::Processing, total))
            .await;
        Ok(())
    }

    /// Best-effort publish bounded by the configured timeout.
    pub async fn publish(&self, snapshot: ProgressSnapshot) {
        match tokio::time::timeout(self.publish_timeout, self.channel.publish(&snapshot)).await {
            Ok(Ok(())) => trace!(
                job_id = %snapshot.job_id,
                status = %snapshot.status,
                processed = snapshot.processed,
                "Published progress"
            ),
            Ok(Err(e)) => warn!(job_id = %snapshot.job_id, error = %e, "Progress publish failed"),
            Err(_) => warn!(
                job_id = %snapshot.job_id,
                timeout_ms = self.publish_timeout.as_millis() as u64,
                "Progress publish timed out"
            ),
        }
    }
}
