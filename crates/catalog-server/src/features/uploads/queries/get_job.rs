//! Get upload job query

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::import::store::JobStore;
use crate::import::{ImportError, ImportResult, Job};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobQuery {
    pub job_id: Uuid,
}

pub async fn handle(jobs: &dyn JobStore, query: GetJobQuery) -> ImportResult<Job> {
    jobs.get(query.job_id)
        .await?
        .ok_or(ImportError::JobNotFound(query.job_id))
}
