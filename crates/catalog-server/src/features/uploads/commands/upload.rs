//! Direct CSV upload
//!
//! Streams the request body to the upload directory, records the job as
//! `uploaded` and enqueues the import. The caller gets the job id back as soon
//! as the task is queued.

use axum::body::Bytes;
use catalog_common::JobStatus;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::features::FeatureState;
use crate::import::source::SourceLocator;
use crate::import::{ImportError, ImportTask, NewJob};

const MAX_FILENAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCsvCommand {
    pub filename: String,
}

/// Body of the 202 response shared by every hand-off endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

impl UploadAccepted {
    pub fn queued(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobStatus::Processing,
            message: "Import queued".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Filename is required and cannot be empty")]
    FilenameRequired,
    #[error("Filename must not exceed 255 characters")]
    FilenameLength,
    #[error("Only .csv files are accepted, got '{0}'")]
    NotCsv(String),
    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    #[error("Failed to read upload body: {0}")]
    Read(String),
    #[error("Failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::FilenameRequired
            | UploadError::FilenameLength
            | UploadError::NotCsv(_)
            | UploadError::Read(_) => AppError::BadRequest(err.to_string()),
            UploadError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            UploadError::Io(e) => AppError::Io(e),
            UploadError::Import(e) => e.into(),
        }
    }
}

impl UploadCsvCommand {
    pub fn validate(&self) -> Result<(), UploadError> {
        validate_csv_filename(&self.filename)
    }
}

/// Shared by the direct and presigned upload paths.
pub fn validate_csv_filename(filename: &str) -> Result<(), UploadError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(UploadError::FilenameRequired);
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(UploadError::FilenameLength);
    }
    if !filename.to_ascii_lowercase().ends_with(".csv") {
        return Err(UploadError::NotCsv(filename.to_string()));
    }
    Ok(())
}

#[tracing::instrument(skip(state, body), fields(filename = %command.filename))]
pub async fn handle<S, E>(
    state: &FeatureState,
    command: UploadCsvCommand,
    body: S,
) -> Result<UploadAccepted, UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    command.validate()?;

    let job_id = Uuid::new_v4();
    state
        .jobs
        .create(NewJob::new(job_id, command.filename.trim(), JobStatus::Uploading))
        .await?;

    let path = state.import.upload_dir.join(format!("{}.csv", job_id));

    match hand_off(state, job_id, &path, body).await {
        Ok(bytes) => {
            info!(%job_id, bytes, "Upload staged and queued");
            Ok(UploadAccepted::queued(job_id))
        },
        Err(e) => {
            discard(state, job_id, &path).await;
            Err(e)
        },
    }
}

async fn hand_off<S, E>(
    state: &FeatureState,
    job_id: Uuid,
    path: &Path,
    body: S,
) -> Result<u64, UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let bytes = stage(body, path, state.import.max_upload_bytes).await?;

    let locator = SourceLocator::Local {
        path: path.to_path_buf(),
    };
    state.jobs.mark_uploaded(job_id, &locator).await?;
    state.queue.enqueue(ImportTask::new(job_id, locator)).await?;

    Ok(bytes)
}

/// Write `body` to `path`, failing once more than `limit` bytes arrive.
async fn stage<S, E>(body: S, path: &Path, limit: u64) -> Result<u64, UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut body = std::pin::pin!(body);
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UploadError::Read(e.to_string()))?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(UploadError::TooLarge { limit });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(written)
}

/// Remove the staged file and the job record after a failed hand-off.
async fn discard(state: &FeatureState, job_id: Uuid, path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(%job_id, error = %e, "Failed to remove staged upload");
        }
    }
    if let Err(e) = state.jobs.delete(job_id).await {
        warn!(%job_id, error = %e, "Failed to delete job after rejected upload");
    }
}
