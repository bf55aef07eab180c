//! Outbound delivery to the requesting contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::CallbackError;
use crate::models::{ConsensusMethod, ConsensusResult, NodeId, OracleValue, Request, RequestId};

/// Body of a `callback(requestId, value)` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub request_id: RequestId,
    pub requester: String,
    pub callback: String,
    pub value: OracleValue,
    pub method: ConsensusMethod,
    pub contributing_nodes: BTreeSet<NodeId>,
    pub decided_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(request: &Request, result: &ConsensusResult) -> Self {
        Self {
            request_id: request.id,
            requester: request.requester.clone(),
            callback: request.callback.clone(),
            value: result.value.clone(),
            method: result.method,
            contributing_nodes: result.contributing_nodes.clone(),
            decided_at: result.decided_at,
        }
    }
}

#[async_trait]
pub trait CallbackDispatcher: Send + Sync {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), CallbackError>;
}

/// Posts deliveries as JSON to a relay endpoint that invokes the contract
#[derive(Clone)]
pub struct HttpCallbackDispatcher {
    http: Client,
    endpoint: String,
}

impl HttpCallbackDispatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CallbackDispatcher for HttpCallbackDispatcher {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), CallbackError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(delivery)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallbackError::Timeout
                } else {
                    CallbackError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(request_id = %delivery.request_id, endpoint = %self.endpoint, "callback accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(CallbackError::Rejected(format!("HTTP {status}: {body}")))
        } else {
            Err(CallbackError::Transport(format!("HTTP {status}: {body}")))
        }
    }
}

/// Logs deliveries; used when no callback transport is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait]
impl CallbackDispatcher for LoggingDispatcher {
    async fn dispatch(&self, delivery: &Delivery) -> Result<(), CallbackError> {
        info!(
            request_id = %delivery.request_id,
            requester = %delivery.requester,
            callback = %delivery.callback,
            value = %delivery.value,
            "callback delivered"
        );
        Ok(())
    }
}
