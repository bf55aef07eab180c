//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::coordinator::Coordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

impl FromRef<AppState> for Arc<Coordinator> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.coordinator.clone()
    }
}
