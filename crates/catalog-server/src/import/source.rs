//! Where an import reads its CSV from

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::{ImportError, ImportResult};
use crate::storage::Storage;

/// Location of a staged upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLocator {
    /// A file on the worker's filesystem
    Local { path: PathBuf },
    /// An object in the configured bucket
    Remote { key: String },
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceLocator::Local { path } => write!(f, "file://{}", path.display()),
            SourceLocator::Remote { key } => write!(f, "s3://{}", key),
        }
    }
}

pub type SourceReader = Pin<Box<dyn AsyncRead + Send>>;

/// Opens and releases staged sources.
///
/// A source may be opened more than once (row counting re-reads it).
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn open(&self, locator: &SourceLocator) -> ImportResult<SourceReader>;

    /// Delete the staged resource. Missing resources are not an error.
    async fn release(&self, locator: &SourceLocator) -> ImportResult<()>;
}

/// Local files plus, when configured, the S3 bucket
#[derive(Clone, Default)]
pub struct StagedSources {
    storage: Option<Storage>,
}

impl StagedSources {
    pub fn new(storage: Option<Storage>) -> Self {
        Self { storage }
    }

    pub fn local_only() -> Self {
        Self { storage: None }
    }

    fn storage(&self) -> ImportResult<&Storage> {
        self.storage
            .as_ref()
            .ok_or_else(|| ImportError::Source("remote storage is not configured".to_string()))
    }
}

#[async_trait]
impl DataSource for StagedSources {
    async fn open(&self, locator: &SourceLocator) -> ImportResult<SourceReader> {
        match locator {
            SourceLocator::Local { path } => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ImportError::Source(format!("staged file {} not found", path.display()))
                    } else {
                        ImportError::Io(e)
                    }
                })?;
                Ok(Box::pin(file))
            },
            SourceLocator::Remote { key } => {
                let body = self
                    .storage()?
                    .download_stream(key)
                    .await
                    .map_err(|e| ImportError::Storage(format!("{:#}", e)))?;
                Ok(Box::pin(body.into_async_read()))
            },
        }
    }

    async fn release(&self, locator: &SourceLocator) -> ImportResult<()> {
        match locator {
            SourceLocator::Local { path } => match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed staged file");
                    Ok(())
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "Staged file already gone");
                    Ok(())
                },
                Err(e) => Err(ImportError::Io(e)),
            },
            SourceLocator::Remote { key } => self
                .storage()?
                .delete(key)
                .await
                .map_err(|e| ImportError::Storage(format!("{:#}", e))),
        }
    }
}
