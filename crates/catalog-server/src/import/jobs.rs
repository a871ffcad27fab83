//! Job records and queue payloads

use catalog_common::{JobStatus, ProgressSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::source::SourceLocator;

/// One tracked import of one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub filename: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub created_rows: i64,
    pub updated_rows: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub source: Option<Json<SourceLocator>>,
    #[serde(skip)]
    pub worker_hostname: Option<String>,
    #[serde(skip)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh record as the initiating upload creates it.
    pub fn new(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: new.id,
            filename: new.filename,
            status: new.status,
            total_rows: 0,
            processed_rows: 0,
            created_rows: 0,
            updated_rows: 0,
            error_message: None,
            source: new.source.map(Json),
            worker_hostname: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source_locator(&self) -> Option<&SourceLocator> {
        self.source.as_ref().map(|json| &json.0)
    }

    pub fn counters(&self) -> ImportCounters {
        ImportCounters {
            processed: self.processed_rows,
            created: self.created_rows,
            updated: self.updated_rows,
        }
    }

    /// Progress snapshot derived from the persisted record.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.id,
            status: self.status,
            processed: self.processed_rows,
            total: self.total_rows,
            created: self.created_rows,
            updated: self.updated_rows,
            error: self.error_message.clone(),
        }
    }
}

/// Input for creating a job record
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub source: Option<SourceLocator>,
}

impl NewJob {
    pub fn new(id: Uuid, filename: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id,
            filename: filename.into(),
            status,
            source: None,
        }
    }

    pub fn with_source(mut self, source: SourceLocator) -> Self {
        self.source = Some(source);
        self
    }
}

/// Running totals of one import.
///
/// `created + updated == processed` holds after every [`add`](Self::add).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounters {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
}

impl ImportCounters {
    pub fn add(&mut self, created: u64, updated: u64) {
        let created = created as i64;
        let updated = updated as i64;
        self.created += created;
        self.updated += updated;
        self.processed += created + updated;
    }

    pub fn snapshot(&self, job_id: Uuid, status: JobStatus, total: i64) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id,
            status,
            processed: self.processed,
            total,
            created: self.created,
            updated: self.updated,
            error: None,
        }
    }
}

/// Queue payload for one import invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub job_id: Uuid,
    pub source: SourceLocator,
    pub enqueued_at: DateTime<Utc>,
}

impl ImportTask {
    pub fn new(job_id: Uuid, source: SourceLocator) -> Self {
        Self {
            job_id,
            source,
            enqueued_at: Utc::now(),
        }
    }
}

/// Final counts of a completed import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub job_id: Uuid,
    pub total_rows: i64,
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Completed(ImportSummary),
    /// The task was delivered for a job that cannot be claimed, e.g. one that
    /// already reached a terminal state.
    Skipped { status: JobStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_counters_stay_balanced() {
        let mut counters = ImportCounters::default();
        counters.add(900, 100);
        counters.add(0, 500);

        assert_eq!(counters.processed, 1500);
        assert_eq!(counters.created + counters.updated, counters.processed);
    }

    #[test]
    fn test_job_serialization_hides_internal_fields() {
        let job = Job::new(
            NewJob::new(Uuid::new_v4(), "catalog.csv", JobStatus::Uploaded).with_source(
                SourceLocator::Local {
                    path: PathBuf::from("/tmp/catalog.csv"),
                },
            ),
        );

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "uploaded");
        assert_eq!(json["filename"], "catalog.csv");
        assert!(json.get("source").is_none());
        assert!(json.get("error_message").is_none());
        assert!(job.source_locator().is_some());
    }

    #[test]
    fn test_task_payload_round_trip() {
        let task = ImportTask::new(
            Uuid::new_v4(),
            SourceLocator::Remote {
                key: "uploads/a.csv".into(),
            },
        );
        let parsed: ImportTask =
            serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(parsed, task);
    }
}
