//! Query route handlers.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::engine::{Filter, FilterGroup, FilterOperator, PaginateOptions, PaginationResult};
use crate::error::{EngineError, EngineResult};
use crate::models::AccessContext;
use crate::state::AppState;

/// Create the query router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/query", post(query))
        .route("/api/count", post(count))
}

/// A query submitted on behalf of a caller.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Option<FilterGroup>,

    /// Authorization facts of the caller.
    pub access: AccessContext,

    #[serde(default)]
    pub options: PaginateOptions,
}

impl QueryRequest {
    /// Script filters are reserved for in-process callers.
    fn checked_filters(&self) -> EngineResult<Option<&FilterGroup>> {
        if self.filters.as_ref().is_some_and(group_has_script) {
            return Err(EngineError::Unsupported(
                "script filters are not accepted over HTTP".into(),
            ));
        }
        Ok(self.filters.as_ref())
    }
}

fn filter_has_script(filter: &Filter) -> bool {
    filter.operator == FilterOperator::Script
        || filter
            .nested
            .as_deref()
            .is_some_and(|nested| nested.iter().any(filter_has_script))
}

fn group_has_script(group: &FilterGroup) -> bool {
    group.filters.iter().any(filter_has_script) || group.filter_groups.iter().any(group_has_script)
}

/// Count response.
#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> EngineResult<Json<PaginationResult>> {
    let page = state
        .engine()
        .paginate(request.checked_filters()?, &request.access, &request.options)
        .await?;
    Ok(Json(page))
}

async fn count(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> EngineResult<Json<CountResponse>> {
    let count = state
        .engine()
        .count(request.checked_filters()?, &request.access, &request.options)
        .await?;
    Ok(Json(CountResponse { count }))
}
