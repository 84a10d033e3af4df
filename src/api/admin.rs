//! Admin API endpoints
//!
//! Operator tooling for the dead-letter queue and remote instances.
//! Deployment is expected to keep these routes behind its own access
//! control; they are never exposed to end users.

use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::{FailedDelivery, Instance};
use crate::error::AppError;

/// Create admin router
///
/// Routes:
/// - GET /api/admin/dead_letters - List dead-letter records
/// - GET /api/admin/dead_letters/:id - Inspect one record
/// - POST /api/admin/dead_letters/:id/retry - Single manual retry
/// - POST /api/admin/dead_letters/:id/discard - Terminal discard
/// - GET /api/admin/instances - List known instances
/// - POST /api/admin/instances/:domain/refresh - Hard refresh
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/dead_letters", get(list_dead_letters))
        .route("/dead_letters/:id", get(get_dead_letter))
        .route("/dead_letters/:id/retry", post(retry_dead_letter))
        .route("/dead_letters/:id/discard", post(discard_dead_letter))
        .route("/instances", get(list_instances))
        .route("/instances/:domain/refresh", post(refresh_instance))
}

// =============================================================================
// Dead-letter queue
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
}

/// GET /api/admin/dead_letters
async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FailedDelivery>>, AppError> {
    let limit = query.limit.unwrap_or(100).min(500);
    let records = state.db.list_failed_deliveries(limit).await?;
    Ok(Json(records))
}

/// GET /api/admin/dead_letters/:id
async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FailedDelivery>, AppError> {
    let record = state
        .db
        .get_failed_delivery(&id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    delivered: bool,
}

/// POST /api/admin/dead_letters/:id/retry
///
/// One immediate attempt; the record is deleted on success and left
/// untouched on failure.
async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, AppError> {
    let delivered = state.dead_letters.retry(&id).await?;
    Ok(Json(RetryResponse { delivered }))
}

#[derive(Debug, Deserialize)]
struct DiscardRequest {
    resolved_by: String,
}

/// POST /api/admin/dead_letters/:id/discard
async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DiscardRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.dead_letters.discard(&id, &body.resolved_by).await?;
    Ok(Json(serde_json::json!({ "discarded": true })))
}

// =============================================================================
// Instances
// =============================================================================

/// GET /api/admin/instances
async fn list_instances(
    State(state): State<AppState>,
) -> Result<Json<Vec<Instance>>, AppError> {
    let instances = state.db.list_instances().await?;
    Ok(Json(instances))
}

/// POST /api/admin/instances/:domain/refresh
///
/// Clears the pagination cursor and polls the instance immediately.
async fn refresh_instance(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.poller.refresh_instance(&domain).await?;
    Ok(Json(serde_json::json!({ "refreshed": true })))
}
