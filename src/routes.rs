//! Route definitions for the oracle coordinator API

use axum::{
    routing::{get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// Request routes
pub fn request_routes() -> Router<AppState> {
    Router::new()
        .route("/api/requests", post(submit_request).get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/consensus", get(get_consensus))
        .route("/api/requests/:id/responses", get(get_responses))
}

// Node response routes
pub fn response_routes() -> Router<AppState> {
    Router::new().route("/api/responses", post(post_response))
}

/// Full API router without transport layers
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(request_routes())
        .merge(response_routes())
        .with_state(state)
}
