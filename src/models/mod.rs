//! Data models for the oracle coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

pub mod consensus;
pub mod request;
pub mod response;
pub mod value;

pub use consensus::{ConsensusMethod, ConsensusResult, Decision};
pub use request::{
    Amount, DataSource, FailureReason, Request, RequestId, RequestPayload, RequestState,
    SourceKind, Transform, ValueKind,
};
pub use response::{NodeId, Receipt, Response, SignedResponse};
pub use value::OracleValue;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// Machine-readable error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code.into()),
        }
    }
}

/// Request DTO for submitting an oracle request
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequestBody {
    pub payload: RequestPayload,
    #[validate(length(min = 1))]
    pub requester: String,
    #[validate(length(min = 1))]
    pub callback: String,
    #[validate(range(min = 1))]
    pub fee: u64, // `Amount` alias spelled out: validator derive cannot see through type aliases
    pub deadline: DateTime<Utc>,
}

/// Response DTO for request submission
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequestReply {
    pub id: RequestId,
    pub state: RequestState,
}

/// Query parameters for listing requests
#[derive(Debug, Default, Deserialize)]
pub struct ListRequestsQuery {
    pub state: Option<RequestState>,
}

/// Responses collected for a request
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResponsesView {
    pub counted: Vec<Response>,
    pub audit: Vec<Response>,
}
