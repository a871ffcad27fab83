//! Uploads feature module
//!
//! Accepts catalog CSVs, hands them to the import queue and exposes job
//! status both as a poll endpoint and as a Server-Sent Events stream.

pub mod commands;
pub mod queries;
pub mod routes;

pub use routes::uploads_routes;
