//! Create product command
//!
//! Inserts one product. A key that already exists (case-insensitively) is a
//! conflict and nothing is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::features::shared::is_unique_violation;
use crate::import::notifier::{LifecycleNotifier, WebhookEvent};
use crate::import::parser::{RowRecord, RowRejection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProductCommand {
    pub sku: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateProductError {
    #[error("Invalid product: {0}")]
    Validation(#[from] RowRejection),

    #[error("Product with sku '{0}' already exists")]
    DuplicateSku(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<CreateProductError> for AppError {
    fn from(err: CreateProductError) -> Self {
        match err {
            CreateProductError::Validation(_) => AppError::Validation(err.to_string()),
            CreateProductError::DuplicateSku(_) => AppError::Conflict(err.to_string()),
            CreateProductError::Database(e) => AppError::Database(e),
        }
    }
}

impl CreateProductCommand {
    /// Normalize into the row shape imports use.
    pub fn validate(&self) -> Result<RowRecord, CreateProductError> {
        Ok(RowRecord::from_fields(
            Some(&self.sku),
            Some(&self.name),
            self.description.as_deref(),
        )?)
    }
}

#[tracing::instrument(skip(pool, notifier, command), fields(sku = %command.sku))]
pub async fn handle(
    pool: &PgPool,
    notifier: &dyn LifecycleNotifier,
    command: CreateProductCommand,
) -> Result<Product, CreateProductError> {
    let row = command.validate()?;

    let product = sqlx::query_as::<_, Product>(
        r#"
        INSERT INTO products (sku, name, description, active)
        VALUES ($1, $2, $3, $4)
        RETURNING id, sku, name, description, active, created_at, updated_at
        "#,
    )
    .bind(&row.sku)
    .bind(&row.name)
    .bind(&row.description)
    .bind(row.active)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CreateProductError::DuplicateSku(row.sku.clone())
        } else {
            CreateProductError::Database(e)
        }
    })?;

    tracing::info!(id = %product.id, "Product created");

    notifier
        .notify(WebhookEvent::ProductCreated {
            id: product.id,
            sku: product.sku.clone(),
            name: product.name.clone(),
            description: product.description.clone(),
            active: product.active,
        })
        .await;

    Ok(product)
}
