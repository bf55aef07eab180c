use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use validator::Validate;

use super::error::ApiError;
use crate::coordinator::Coordinator;
use crate::models::{
    ApiResponse, ConsensusResult, ListRequestsQuery, Request, RequestId, RequestState,
    ResponsesView, SubmitRequestBody, SubmitRequestReply,
};

/// Submit a new oracle request
pub async fn submit_request(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<SubmitRequestBody>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitRequestReply>>), ApiError> {
    body.validate()?;

    let id = coordinator.submit(
        body.payload,
        body.requester,
        body.callback,
        body.fee,
        body.deadline,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(SubmitRequestReply {
            id,
            state: RequestState::Pending,
        })),
    ))
}

/// List requests, optionally filtered by `?state=`
pub async fn list_requests(
    State(coordinator): State<Arc<Coordinator>>,
    Query(query): Query<ListRequestsQuery>,
) -> Json<ApiResponse<Vec<Request>>> {
    Json(ApiResponse::ok(coordinator.ledger().list(query.state)))
}

pub async fn get_request(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<RequestId>,
) -> Result<Json<ApiResponse<Request>>, ApiError> {
    let request = coordinator.ledger().get(id)?;
    Ok(Json(ApiResponse::ok(request)))
}

pub async fn get_consensus(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<RequestId>,
) -> Result<Json<ApiResponse<ConsensusResult>>, ApiError> {
    coordinator.ledger().get(id)?;
    let result = coordinator
        .aggregator()
        .result(id)
        .ok_or_else(|| ApiError::not_found(format!("no consensus for request {id}")))?;
    Ok(Json(ApiResponse::ok(result)))
}

pub async fn get_responses(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<RequestId>,
) -> Result<Json<ApiResponse<ResponsesView>>, ApiError> {
    coordinator.ledger().get(id)?;
    Ok(Json(ApiResponse::ok(coordinator.aggregator().responses(id))))
}
