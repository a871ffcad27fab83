//! HTTP feature slices
//!
//! Each feature is a vertical slice:
//! - `commands/` - write operations
//! - `queries/` - read operations
//! - `routes.rs` - axum handlers and route table
//!
//! # Features
//!
//! - **uploads**: CSV upload hand-off, job status and the live progress stream
//! - **products**: single product creation outside the import flow

pub mod products;
pub mod shared;
pub mod uploads;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;

use crate::config::{CorsConfig, ImportConfig};
use crate::import::notifier::LifecycleNotifier;
use crate::import::progress::ProgressChannel;
use crate::import::queue::TaskQueue;
use crate::import::store::JobStore;
use crate::middleware;
use crate::storage::Storage;

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub db: sqlx::PgPool,
    pub jobs: Arc<dyn JobStore>,
    pub channel: Arc<dyn ProgressChannel>,
    pub queue: Arc<dyn TaskQueue>,
    pub notifier: Arc<dyn LifecycleNotifier>,
    /// Present when presigned uploads are enabled
    pub storage: Option<Storage>,
    pub import: Arc<ImportConfig>,
}

/// Feature routes, mounted by [`app`] under `/api/v1`
///
/// - `/uploads` - import hand-off and progress
/// - `/products` - product creation
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/uploads", uploads::uploads_routes(&state.import).with_state(state.clone()))
        .nest("/products", products::products_routes().with_state(state))
}

/// Complete application: feature routes, health check and middleware stack.
pub fn app(state: FeatureState, cors: &CorsConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state.db.clone())
        .nest("/api/v1", router(state))
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(cors))
}

async fn health_check(State(db): State<sqlx::PgPool>) -> impl IntoResponse {
    match crate::db::health_check(&db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        ),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "unreachable"
                })),
            )
        },
    }
}
