//! Progress stream relay: live snapshots, terminal close and record fallback

mod common;

use catalog_common::{JobStatus, ProgressSnapshot};
use catalog_server::features::uploads::queries::stream_progress::{
    handle, SnapshotStream, StreamProgressQuery,
};
use catalog_server::import::progress::{BroadcastChannel, ProgressChannel};
use catalog_server::import::store::JobStore;
use catalog_server::import::{ImportError, NewJob};
use common::{MemoryJobStore, UnavailableChannel};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POLL: Duration = Duration::from_millis(20);

fn query(job_id: Uuid) -> StreamProgressQuery {
    StreamProgressQuery {
        job_id,
        poll_interval: POLL,
    }
}

fn snapshot(job_id: Uuid, status: JobStatus, processed: i64) -> ProgressSnapshot {
    ProgressSnapshot {
        job_id,
        status,
        processed,
        total: 3000,
        created: processed,
        updated: 0,
        error: None,
    }
}

async fn processing_job(jobs: &MemoryJobStore) -> Uuid {
    let id = Uuid::new_v4();
    jobs.create(NewJob::new(id, "catalog.csv", JobStatus::Processing))
        .await
        .unwrap();
    id
}

async fn collect(stream: SnapshotStream) -> Vec<ProgressSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not end")
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let jobs = Arc::new(MemoryJobStore::new());
    let channel = Arc::new(BroadcastChannel::new());

    let result = handle(jobs, channel, query(Uuid::new_v4())).await;

    assert!(matches!(result, Err(ImportError::JobNotFound(_))));
}

#[tokio::test]
async fn test_finished_job_emits_record_once() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;
    jobs.update(id, |job| {
        job.status = JobStatus::Completed;
        job.total_rows = 40;
        job.processed_rows = 40;
        job.created_rows = 30;
        job.updated_rows = 10;
    });

    let stream = handle(jobs, Arc::new(BroadcastChannel::new()), query(id))
        .await
        .unwrap();
    let snapshots = collect(stream).await;

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, JobStatus::Completed);
    assert_eq!(snapshots[0].processed, 40);
    assert_eq!(snapshots[0].created, 30);
    assert_eq!(snapshots[0].updated, 10);
}

#[tokio::test]
async fn test_relays_live_snapshots_until_terminal() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;
    let channel = Arc::new(BroadcastChannel::new());

    let stream = handle(jobs, channel.clone(), query(id)).await.unwrap();

    for processed in [1000, 2000] {
        channel
            .publish(&snapshot(id, JobStatus::Processing, processed))
            .await
            .unwrap();
    }
    channel
        .publish(&snapshot(id, JobStatus::Completed, 3000))
        .await
        .unwrap();
    // Published after the terminal snapshot, never relayed
    channel
        .publish(&snapshot(id, JobStatus::Processing, 9999))
        .await
        .unwrap();

    let snapshots = collect(stream).await;

    assert_eq!(
        snapshots.iter().map(|s| s.processed).collect::<Vec<_>>(),
        vec![1000, 2000, 3000]
    );
    assert_eq!(snapshots.last().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_other_jobs_are_not_relayed() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;
    let other = processing_job(&jobs).await;
    let channel = Arc::new(BroadcastChannel::new());

    let stream = handle(jobs.clone(), channel.clone(), query(id)).await.unwrap();
    let _other_stream = handle(jobs, channel.clone(), query(other)).await.unwrap();

    channel
        .publish(&snapshot(other, JobStatus::Processing, 500))
        .await
        .unwrap();
    channel
        .publish(&snapshot(id, JobStatus::Failed, 0))
        .await
        .unwrap();

    let snapshots = collect(stream).await;

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].job_id, id);
}

#[tokio::test]
async fn test_missed_terminal_snapshot_falls_back_to_record() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;
    let channel = Arc::new(BroadcastChannel::new());

    let stream = handle(jobs.clone(), channel.clone(), query(id))
        .await
        .unwrap();

    channel
        .publish(&snapshot(id, JobStatus::Processing, 1000))
        .await
        .unwrap();
    // The job finishes but its terminal snapshot is lost
    jobs.update(id, |job| {
        job.status = JobStatus::Failed;
        job.processed_rows = 1000;
        job.created_rows = 1000;
        job.error_message = Some("Database error: pool timed out".into());
    });

    let snapshots = collect(stream).await;

    assert_eq!(snapshots.len(), 2);
    let last = &snapshots[1];
    assert_eq!(last.status, JobStatus::Failed);
    assert_eq!(last.processed, 1000);
    assert_eq!(last.error.as_deref(), Some("Database error: pool timed out"));
}

#[tokio::test]
async fn test_unavailable_channel_polls_record() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;

    let stream = handle(jobs.clone(), Arc::new(UnavailableChannel), query(id))
        .await
        .unwrap();

    let finisher = {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            jobs.update(id, |job| {
                job.status = JobStatus::Completed;
                job.total_rows = 5;
                job.processed_rows = 5;
                job.created_rows = 5;
            });
        })
    };

    let snapshots = collect(stream).await;
    finisher.await.unwrap();

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, JobStatus::Completed);
    assert_eq!(snapshots[0].processed, 5);
}

#[tokio::test]
async fn test_deleted_job_ends_stream() {
    let jobs = Arc::new(MemoryJobStore::new());
    let id = processing_job(&jobs).await;

    let stream = handle(jobs.clone(), Arc::new(BroadcastChannel::new()), query(id))
        .await
        .unwrap();
    jobs.delete(id).await.unwrap();

    assert!(collect(stream).await.is_empty());
}
