//! Shared utilities for feature modules

pub mod error_helpers;

pub use error_helpers::is_unique_violation;
