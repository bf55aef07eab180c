use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::request::{FailureReason, RequestId};
use super::response::NodeId;
use super::value::OracleValue;

/// Deterministic reduction of many responses to one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    #[default]
    Median,
    MajorityEqual,
    Mode,
}

impl fmt::Display for ConsensusMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusMethod::Median => "median",
            ConsensusMethod::MajorityEqual => "majority_equal",
            ConsensusMethod::Mode => "mode",
        };
        f.write_str(name)
    }
}

impl FromStr for ConsensusMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "median" => Ok(ConsensusMethod::Median),
            "majority_equal" | "majorityequal" | "majority" => Ok(ConsensusMethod::MajorityEqual),
            "mode" => Ok(ConsensusMethod::Mode),
            other => Err(format!("unknown consensus method: {other}")),
        }
    }
}

/// Immutable outcome of aggregation for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub request_id: RequestId,
    pub value: OracleValue,
    /// Nodes whose values made it into the final aggregate
    pub contributing_nodes: BTreeSet<NodeId>,
    pub method: ConsensusMethod,
    /// Distinct nodes counted toward quorum, outliers included
    pub responders: usize,
    pub decided_at: DateTime<Utc>,
}

/// What the aggregator emitted for a request, exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Consensus(ConsensusResult),
    Failed {
        request_id: RequestId,
        reason: FailureReason,
    },
}

impl Decision {
    pub fn request_id(&self) -> RequestId {
        match self {
            Decision::Consensus(result) => result.request_id,
            Decision::Failed { request_id, .. } => *request_id,
        }
    }
}
