//! Catalog Server Library
//!
//! Bulk product-catalog import service.
//!
//! # Overview
//!
//! - **Import pipeline** ([`import`]): streaming CSV parse, fixed-size batches,
//!   idempotent upsert, durable progress checkpoints, live progress fan-out and
//!   lifecycle webhooks, run by background workers
//! - **HTTP API** ([`features`]): upload hand-off, job status, Server-Sent
//!   Events progress stream, product creation
//! - **Database** ([`db`]): PostgreSQL via SQLx, schema in `migrations/`
//! - **Storage** ([`storage`]): optional S3-compatible bucket for presigned uploads
//! - **Configuration** ([`config`]): environment-based, loaded once at start-up
//!
//! # Example
//!
//! ```no_run
//! use catalog_server::{config::Config, db};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::run_migrations(&pool).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod import;
pub mod middleware;
pub mod storage;

pub use error::AppError;
