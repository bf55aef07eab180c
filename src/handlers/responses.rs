use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::debug;

use super::error::ApiError;
use crate::coordinator::Coordinator;
use crate::models::{ApiResponse, Receipt, SignedResponse};

/// Ingest a signed node response.
///
/// `202` when counted toward quorum, `200` for duplicates and for late
/// responses kept for audit.
pub async fn post_response(
    State(coordinator): State<Arc<Coordinator>>,
    Json(signed): Json<SignedResponse>,
) -> Result<(StatusCode, Json<ApiResponse<Receipt>>), ApiError> {
    let request_id = signed.response.request_id;
    let node_id = signed.response.node_id.clone();

    let receipt = coordinator.ingest(signed).await?;
    debug!(request_id = %request_id, node_id = %node_id, ?receipt, "response ingested");

    let status = match receipt {
        Receipt::Counted { .. } => StatusCode::ACCEPTED,
        Receipt::Duplicate | Receipt::Audited => StatusCode::OK,
    };
    Ok((status, Json(ApiResponse::ok(receipt))))
}
