use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::request::RequestId;
use super::value::OracleValue;

/// Oracle node identity: the hex-encoded Ed25519 verifying key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One node's reported value for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub value: OracleValue,
    pub submitted_at: DateTime<Utc>,
}

/// A response together with the node's hex-encoded signature over it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedResponse {
    #[serde(flatten)]
    pub response: Response,
    pub signature: String,
}

/// How the coordinator accounted for a submitted response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Receipt {
    /// Counted toward quorum; `responders` distinct nodes so far
    Counted { responders: usize },
    /// Same `(request, node)` pair was already counted
    Duplicate,
    /// Arrived after the result was decided; kept for audit only
    Audited,
}
