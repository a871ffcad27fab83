//! Products feature module
//!
//! Single product creation outside the bulk import flow. Keys follow the same
//! normalization as imported rows, so a product created here is updated, not
//! duplicated, by a later import.

pub mod commands;
pub mod routes;

pub use routes::products_routes;
