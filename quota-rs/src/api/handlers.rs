//! Storage usage endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::error::ApiError;
use crate::ledger::{UserId, WorldId};
use crate::projection::{ProjectionSynchronizer, StorageDetail, StorageSummary};

/// Shared state for API handlers
pub struct AppState {
    pub projections: Arc<ProjectionSynchronizer>,
}

#[derive(Debug, Deserialize)]
pub struct EntitiesQuery {
    pub world_id: Option<String>,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.projections.ledger_count().await {
        Ok(ledgers) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "ledgers": ledgers })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        ),
    }
}

/// GET /api/storage/:user_id - Storage summary for a user
pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<StorageSummary>, Response> {
    let summary = state
        .projections
        .summary(&UserId::new(user_id))
        .await
        .map_err(IntoResponse::into_response)?;

    summary.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("No storage ledger for user")),
        )
            .into_response()
    })
}

/// GET /api/storage/:user_id/entities - Per-entity usage, optionally for one world
pub async fn list_entities(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Vec<StorageDetail>>, Response> {
    let user_id = UserId::new(user_id);

    let details = match query.world_id {
        Some(world_id) => {
            state
                .projections
                .details_for_world(&user_id, &WorldId::new(world_id))
                .await
        }
        None => state.projections.details(&user_id).await,
    };

    details.map(Json).map_err(IntoResponse::into_response)
}
