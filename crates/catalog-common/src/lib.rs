//! Catalog Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the catalog importer.
//!
//! # Overview
//!
//! - **Types**: wire types shared by the server and observers
//!   ([`JobStatus`](types::JobStatus), [`ProgressSnapshot`](types::ProgressSnapshot))
//! - **Logging**: tracing subscriber setup driven by environment variables
//! - **Errors**: the common error type
//!
//! # Example
//!
//! ```no_run
//! use catalog_common::logging::{init_logging, LogConfig};
//! use catalog_common::types::JobStatus;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     assert!(JobStatus::Completed.is_terminal());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CatalogError, Result};
pub use types::{JobStatus, ProgressSnapshot};
