//! Upload routes
//!
//! - `POST /` - multipart CSV upload
//! - `POST /initiate` - presigned upload, step one
//! - `POST /complete` - presigned upload, step two
//! - `GET /:job_id` - job status
//! - `GET /:job_id/stream` - live progress as Server-Sent Events

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use uuid::Uuid;

use super::commands::{
    complete, initiate, upload, CompleteUploadCommand, InitiateUploadCommand, UploadCsvCommand,
};
use super::queries::{get_job, stream_progress};
use crate::config::ImportConfig;
use crate::error::AppError;
use crate::features::FeatureState;

/// Multipart framing allowance on top of the file size limit
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

pub fn uploads_routes(config: &ImportConfig) -> Router<FeatureState> {
    let body_limit: usize = config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES)
        .try_into()
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/", post(upload_csv).layer(DefaultBodyLimit::max(body_limit)))
        .route("/initiate", post(initiate_upload))
        .route("/complete", post(complete_upload))
        .route("/:job_id", get(get_job_status))
        .route("/:job_id/stream", get(stream_job_progress))
}

/// Upload a CSV and queue its import
///
/// POST /uploads (multipart, field `file`)
async fn upload_csv(
    State(state): State<FeatureState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let command = UploadCsvCommand {
            filename: field.file_name().unwrap_or_default().to_string(),
        };
        let accepted = upload::handle(&state, command, field).await?;

        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    Err(AppError::BadRequest(
        "Multipart field 'file' is required".to_string(),
    ))
}

/// POST /uploads/initiate
async fn initiate_upload(
    State(state): State<FeatureState>,
    Json(command): Json<InitiateUploadCommand>,
) -> Result<Response, AppError> {
    let response = initiate::handle(&state, command).await?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// POST /uploads/complete
async fn complete_upload(
    State(state): State<FeatureState>,
    Json(command): Json<CompleteUploadCommand>,
) -> Result<Response, AppError> {
    let accepted = complete::handle(&state, command).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// Poll the status of an import
///
/// GET /uploads/:job_id
async fn get_job_status(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let job = get_job::handle(state.jobs.as_ref(), get_job::GetJobQuery { job_id }).await?;
    Ok((StatusCode::OK, Json(job)).into_response())
}

/// Stream progress snapshots until the import finishes
///
/// GET /uploads/:job_id/stream
async fn stream_job_progress(
    State(state): State<FeatureState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let query = stream_progress::StreamProgressQuery {
        job_id,
        poll_interval: state.import.stream_poll_interval(),
    };
    let snapshots = stream_progress::handle(state.jobs.clone(), state.channel.clone(), query).await?;

    tracing::debug!(%job_id, "Progress stream opened");

    let events = snapshots.map(|snapshot| Event::default().json_data(snapshot));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
