//! Error types shared across the catalog crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors raised by the shared types
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Invalid job status: {0}")]
    InvalidStatus(String),
}
