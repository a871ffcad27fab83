//! Product routes

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

use super::commands::{create, CreateProductCommand};
use crate::error::AppError;
use crate::features::FeatureState;

pub fn products_routes() -> Router<FeatureState> {
    Router::new().route("/", post(create_product))
}

/// Create a product
///
/// POST /products
async fn create_product(
    State(state): State<FeatureState>,
    Json(command): Json<CreateProductCommand>,
) -> Result<Response, AppError> {
    let product = create::handle(&state.db, state.notifier.as_ref(), command).await?;
    Ok((StatusCode::CREATED, Json(product)).into_response())
}
