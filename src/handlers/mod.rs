//! HTTP handlers for the oracle coordinator API

mod error;
mod requests;
mod responses;

pub use error::ApiError;
pub use requests::{get_consensus, get_request, get_responses, list_requests, submit_request};
pub use responses::post_response;

pub async fn root() -> &'static str {
    "Oracle Coordinator API Server"
}

pub async fn health_check() -> &'static str {
    "OK"
}
