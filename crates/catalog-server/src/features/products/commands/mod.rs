pub mod create;

pub use create::{CreateProductCommand, CreateProductError, Product};
