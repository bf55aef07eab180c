//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use validator::ValidationErrors;

use crate::error::{LedgerError, SignatureError, SubmitError};
use crate::models::ApiResponse;

/// Error returned by handlers, rendered in the `ApiResponse` envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ApiResponse<()> = ApiResponse::err(self.code, self.message);
        (self.status, Json(body)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::InsufficientFee { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "insufficient_fee", message)
            }
            LedgerError::InvalidDeadline { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_deadline", message)
            }
            LedgerError::InvalidPayload(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_payload", message)
            }
            LedgerError::NotFound(_) => Self::not_found(message),
            LedgerError::StaleTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "stale_transition", message)
            }
            LedgerError::IllegalTransition { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "illegal_transition", message)
            }
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let message = err.to_string();
        match err {
            SubmitError::UnknownRequest(_) => Self::not_found(message),
            SubmitError::RequestClosed { .. } => {
                Self::new(StatusCode::CONFLICT, "request_closed", message)
            }
            SubmitError::Signature(SignatureError::UnknownNode(_)) => {
                Self::new(StatusCode::UNAUTHORIZED, "unknown_node", message)
            }
            SubmitError::Signature(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_signature", message)
            }
            SubmitError::Transport(_) => Self::new(StatusCode::BAD_GATEWAY, "transport", message),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(err: ValidationErrors) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
    }
}
