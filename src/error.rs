//! Error types for every coordinator component

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Amount, NodeId, RequestId, RequestState};

/// Request ledger errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("fee {offered} is below the minimum of {minimum}")]
    InsufficientFee { offered: Amount, minimum: Amount },

    #[error("deadline {deadline} is not in the future")]
    InvalidDeadline { deadline: DateTime<Utc> },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("request {id} is {actual}, expected {expected}")]
    StaleTransition {
        id: RequestId,
        expected: RequestState,
        actual: RequestState,
    },

    /// Edge outside the lifecycle graph: a caller contract violation
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: RequestState,
        to: RequestState,
    },

    #[error("request {0} not found")]
    NotFound(RequestId),
}

/// Data retrieval errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("fetch timed out after {0} ms")]
    Timeout(u64),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Transient errors are retried by the node agent; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unreachable(_) | FetchError::Timeout(_))
    }
}

/// Response signature errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    #[error("invalid node key: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    InvalidSignature,
}

/// Errors surfaced to a node posting a response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("request {0} not found")]
    UnknownRequest(RequestId),

    #[error("request {id} is already {state}")]
    RequestClosed { id: RequestId, state: RequestState },

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Node agent errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// This node already has a counted response for the request
    #[error("response for request {0} already submitted")]
    AlreadySubmitted(RequestId),

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Consensus computation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("no value group holds a majority")]
    NoMajority,

    #[error("received {received} responses, at least {required} required")]
    InsufficientResponses { received: usize, required: usize },

    #[error("method requires numeric values")]
    NonNumericValues,
}

/// Callback invocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    #[error("callback rejected: {0}")]
    Rejected(String),

    #[error("callback transport error: {0}")]
    Transport(String),

    #[error("callback timed out")]
    Timeout,
}

/// Fee transfer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreasuryError {
    #[error("transfer of {amount} to {account} failed: {reason}")]
    Transfer {
        account: String,
        amount: Amount,
        reason: String,
    },
}

/// Fulfillment gateway errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
