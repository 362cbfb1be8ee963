//! HTTP route handlers.

pub mod elements;
pub mod health;
pub mod query;

use axum::Router;

use crate::state::AppState;

/// All API routes, with state attached.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(query::router())
        .merge(elements::router())
        .with_state(state)
}
