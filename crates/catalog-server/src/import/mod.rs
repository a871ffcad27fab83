//! Asynchronous bulk CSV import pipeline
//!
//! An upload hands a job id and a [`SourceLocator`](source::SourceLocator) to a
//! [`TaskQueue`](queue::TaskQueue). A worker picks the task up and runs the
//! [`ImportRunner`](runner::ImportRunner), which drives
//!
//! ```text
//! source -> parser -> batcher -> upsert engine -> progress reporter
//!                                                  |-> job record (durable)
//!                                                  `-> progress channel (live)
//! ```
//!
//! and emits lifecycle webhooks on start, completion and failure. Live viewers
//! subscribe to the progress channel through the SSE gateway in
//! `features::uploads`.

pub mod batcher;
pub mod jobs;
pub mod lease;
pub mod notifier;
pub mod parser;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod source;
pub mod store;
pub mod upsert;

use thiserror::Error;
use uuid::Uuid;

pub use jobs::{ImportCounters, ImportOutcome, ImportSummary, ImportTask, Job, NewJob};
pub use runner::{ImportContext, ImportRunner};

/// Fatal import errors. The display string becomes the job's `error_message`.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Upload job {0} not found")]
    JobNotFound(Uuid),

    #[error("Source unavailable: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Parse(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),
}

impl From<csv_async::Error> for ImportError {
    fn from(err: csv_async::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv_async::ErrorKind::Io(io) => ImportError::Io(io),
                other => ImportError::Parse(format!("{:?}", other)),
            }
        } else {
            ImportError::Parse(err.to_string())
        }
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
