//! Mutation route handlers.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::CascadeReport;
use crate::error::EngineResult;
use crate::models::Document;
use crate::state::AppState;

/// Create the elements router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/elements", post(index_elements))
        .route("/api/elements/delete", post(delete_elements))
}

/// Documents to write or delete.
#[derive(Debug, Deserialize)]
pub struct ElementsRequest {
    pub documents: Vec<Document>,
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub indexed: usize,
}

async fn index_elements(
    State(state): State<AppState>,
    Json(request): Json<ElementsRequest>,
) -> EngineResult<Json<IndexResponse>> {
    let indexed = state.engine().index_elements(&request.documents).await?;
    info!(indexed, "elements indexed");
    Ok(Json(IndexResponse { indexed }))
}

async fn delete_elements(
    State(state): State<AppState>,
    Json(request): Json<ElementsRequest>,
) -> EngineResult<Json<CascadeReport>> {
    let report = state.engine().delete_elements(&request.documents).await?;
    Ok(Json(report))
}
