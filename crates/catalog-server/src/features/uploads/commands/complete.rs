//! Presigned upload, step two
//!
//! The client reports that its PUT finished. The object must exist before the
//! job moves to `uploaded` and the import is queued. If queueing fails the job
//! returns to `pending` and the call can be retried.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::upload::UploadAccepted;
use crate::error::AppError;
use crate::features::FeatureState;
use crate::import::source::SourceLocator;
use crate::import::{ImportError, ImportTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadCommand {
    pub job_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum CompleteUploadError {
    #[error("Upload job {0} not found")]
    NotFound(Uuid),
    #[error("Upload job {0} was not initiated as a presigned upload")]
    NotPresigned(Uuid),
    #[error("Object '{0}' has not been uploaded yet")]
    ObjectMissing(String),
    #[error("Presigned uploads require object storage, which is not configured")]
    StorageDisabled,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl From<CompleteUploadError> for AppError {
    fn from(err: CompleteUploadError) -> Self {
        match err {
            CompleteUploadError::NotFound(_) => AppError::NotFound(err.to_string()),
            CompleteUploadError::NotPresigned(_) | CompleteUploadError::ObjectMissing(_) => {
                AppError::Conflict(err.to_string())
            },
            CompleteUploadError::StorageDisabled => AppError::Unavailable(err.to_string()),
            CompleteUploadError::Storage(message) => AppError::Internal(message),
            CompleteUploadError::Import(e) => e.into(),
        }
    }
}

#[tracing::instrument(skip(state), fields(job_id = %command.job_id))]
pub async fn handle(
    state: &FeatureState,
    command: CompleteUploadCommand,
) -> Result<UploadAccepted, CompleteUploadError> {
    let storage = state
        .storage
        .as_ref()
        .ok_or(CompleteUploadError::StorageDisabled)?;

    let job = state
        .jobs
        .get(command.job_id)
        .await?
        .ok_or(CompleteUploadError::NotFound(command.job_id))?;

    let locator = match job.source_locator() {
        Some(locator @ SourceLocator::Remote { .. }) => locator.clone(),
        _ => return Err(CompleteUploadError::NotPresigned(job.id)),
    };

    if let SourceLocator::Remote { key } = &locator {
        let exists = storage
            .exists(key)
            .await
            .map_err(|e| CompleteUploadError::Storage(format!("{:#}", e)))?;
        if !exists {
            return Err(CompleteUploadError::ObjectMissing(key.clone()));
        }
    }

    state.jobs.mark_uploaded(job.id, &locator).await?;
    if let Err(e) = state.queue.enqueue(ImportTask::new(job.id, locator)).await {
        // Back to `pending` so the client can call complete again
        if let Err(reopen) = state.jobs.reopen_upload(job.id).await {
            tracing::error!(job_id = %job.id, error = %reopen, "Failed to reopen upload job");
        }
        return Err(e.into());
    }

    tracing::info!(job_id = %job.id, "Presigned upload completed and queued");

    Ok(UploadAccepted::queued(job.id))
}
