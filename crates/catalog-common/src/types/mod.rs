//! Wire types shared by the import pipeline and its observers

use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an upload job.
///
/// ```text
/// pending -> uploading -> uploaded -> processing -> completed
///                                  \             \
///                                   `-> failed    `-> failed
/// ```
///
/// `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Uploading,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `processing -> processing` is allowed so that a re-delivered task can
    /// take over a job whose lease expired.
    /// `uploaded -> pending` undoes a presigned hand-off whose task never
    /// reached the queue.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Uploading) | (Pending, Uploaded) => true,
            (Uploading, Uploaded) | (Uploaded, Pending) => true,
            (Uploaded, Processing) | (Processing, Processing) => true,
            (Processing, Completed) => true,
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "uploading" => Ok(JobStatus::Uploading),
            "uploaded" => Ok(JobStatus::Uploaded),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(CatalogError::InvalidStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Progress message published while a job runs and persisted alongside it.
///
/// `processed` counts rows that reached the upsert step, so it may trail
/// `total` when malformed rows were skipped; the final `completed` snapshot
/// reports `processed == total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub processed: i64,
    pub total: i64,
    pub created: i64,
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whole-number percentage, 0 when the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.total <= 0 {
            return 0;
        }
        ((self.processed.clamp(0, self.total) * 100) / self.total) as u8
    }
}
