//! Presigned upload, step one
//!
//! Creates a `pending` job whose source is the object key the client will PUT
//! the CSV to, and returns the presigned URL for that key.

use catalog_common::JobStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::upload::{validate_csv_filename, UploadError};
use crate::error::AppError;
use crate::features::FeatureState;
use crate::import::source::SourceLocator;
use crate::import::{ImportError, NewJob};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadCommand {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadResponse {
    pub job_id: Uuid,
    pub key: String,
    pub upload_url: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InitiateUploadError {
    #[error(transparent)]
    Invalid(#[from] UploadError),
    #[error("Presigned uploads require object storage, which is not configured")]
    StorageDisabled,
    #[error("Failed to presign upload: {0}")]
    Presign(String),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl From<InitiateUploadError> for AppError {
    fn from(err: InitiateUploadError) -> Self {
        match err {
            InitiateUploadError::Invalid(e) => e.into(),
            InitiateUploadError::StorageDisabled => AppError::Unavailable(err.to_string()),
            InitiateUploadError::Presign(message) => AppError::Internal(message),
            InitiateUploadError::Import(e) => e.into(),
        }
    }
}

#[tracing::instrument(skip(state), fields(filename = %command.filename))]
pub async fn handle(
    state: &FeatureState,
    command: InitiateUploadCommand,
) -> Result<InitiateUploadResponse, InitiateUploadError> {
    validate_csv_filename(&command.filename)?;
    let storage = state
        .storage
        .as_ref()
        .ok_or(InitiateUploadError::StorageDisabled)?;

    let job_id = Uuid::new_v4();
    let key = storage.upload_key(job_id);
    let upload_url = storage
        .presigned_upload_url(&key)
        .await
        .map_err(|e| InitiateUploadError::Presign(format!("{:#}", e)))?;

    state
        .jobs
        .create(
            NewJob::new(job_id, command.filename.trim(), JobStatus::Pending)
                .with_source(SourceLocator::Remote { key: key.clone() }),
        )
        .await?;

    tracing::info!(%job_id, %key, "Presigned upload initiated");

    Ok(InitiateUploadResponse {
        job_id,
        key,
        upload_url,
        expires_in_secs: storage.presign_expiry().as_secs(),
    })
}
