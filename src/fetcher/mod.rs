//! Off-chain data retrieval
//!
//! A [`Fetcher`] performs exactly one retrieval per call and keeps no shared
//! mutable state. Retries belong to the node agent.

mod extract;
mod http;
mod transform;

pub use extract::{extract, to_pointer};
pub use http::HttpFetcher;
pub use transform::normalize;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::error::FetchError;
use crate::models::{DataSource, OracleValue, RequestPayload};

/// Raw document returned by a data source
#[derive(Debug, Clone, PartialEq)]
pub enum RawDocument {
    Json(Value),
    Text(String),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve the raw document for `source`, giving up after `timeout`.
    async fn retrieve(&self, source: &DataSource, timeout: Duration)
        -> Result<RawDocument, FetchError>;

    /// Retrieve, extract and normalize the value described by `payload`.
    async fn fetch(
        &self,
        payload: &RequestPayload,
        timeout: Duration,
    ) -> Result<OracleValue, FetchError> {
        let raw = self.retrieve(&payload.source, timeout).await?;
        normalize_document(&raw, payload)
    }
}

pub fn normalize_document(
    raw: &RawDocument,
    payload: &RequestPayload,
) -> Result<OracleValue, FetchError> {
    match raw {
        RawDocument::Json(document) => {
            let value = extract(document, payload.path.as_deref())?;
            normalize(value, &payload.transform)
        }
        RawDocument::Text(text) => {
            normalize(&Value::String(text.trim().to_string()), &payload.transform)
        }
    }
}
