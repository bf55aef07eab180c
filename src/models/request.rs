//! Request lifecycle types

use chrono::{DateTime, Utc};
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fee amount in the smallest unit of the settlement token
pub type Amount = u64;

/// Globally unique request identifier, assigned at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Collecting,
    Fulfilled,
    Expired,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Fulfilled | RequestState::Expired | RequestState::Failed
        )
    }

    /// Edges of the lifecycle graph. `Fulfilled -> Failed` exists only for
    /// the delivery winner that exhausted its callback retries.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Collecting)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Collecting, Fulfilled)
                | (Collecting, Expired)
                | (Collecting, Failed)
                | (Fulfilled, Failed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Pending => "pending",
            RequestState::Collecting => "collecting",
            RequestState::Fulfilled => "fulfilled",
            RequestState::Expired => "expired",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(RequestState::Pending),
            "collecting" => Ok(RequestState::Collecting),
            "fulfilled" => Ok(RequestState::Fulfilled),
            "expired" => Ok(RequestState::Expired),
            "failed" => Ok(RequestState::Failed),
            other => Err(format!("unknown request state: {other}")),
        }
    }
}

/// Reason code attached to a request that ended without delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoMajority,
    InsufficientResponses,
    NonNumericValues,
    DeliveryFailed,
    DeadlinePassed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            FailureReason::NoMajority => "no_majority",
            FailureReason::InsufficientResponses => "insufficient_responses",
            FailureReason::NonNumericValues => "non_numeric_values",
            FailureReason::DeliveryFailed => "delivery_failed",
            FailureReason::DeadlinePassed => "deadline_passed",
        };
        f.write_str(code)
    }
}

/// Supported data source kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HttpJson,
    HttpText,
    Inline,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http_json" | "json" => Ok(SourceKind::HttpJson),
            "http_text" | "text" => Ok(SourceKind::HttpText),
            "inline" => Ok(SourceKind::Inline),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// Where a fetcher retrieves the raw document from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    /// GET a JSON document
    HttpJson { url: String },
    /// GET a plain-text document; the trimmed body is the raw value
    HttpText { url: String },
    /// Literal document carried in the request itself
    Inline { body: serde_json::Value },
}

impl DataSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            DataSource::HttpJson { .. } => SourceKind::HttpJson,
            DataSource::HttpText { .. } => SourceKind::HttpText,
            DataSource::Inline { .. } => SourceKind::Inline,
        }
    }

    pub fn host(&self) -> Option<String> {
        match self {
            DataSource::HttpJson { url } | DataSource::HttpText { url } => Url::parse(url)
                .ok()
                .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase())),
            DataSource::Inline { .. } => None,
        }
    }
}

/// Expected type of the extracted datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Numeric,
    Text,
    Boolean,
}

/// Deterministic post-processing applied after extraction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    #[serde(default)]
    pub kind: ValueKind,
    /// Scale factor applied to numeric values, e.g. `100` for cents
    #[serde(default)]
    pub multiplier: Option<Decimal>,
    /// Round numeric values to this many decimal places (half-even)
    #[serde(default)]
    pub decimals: Option<u32>,
}

/// What to fetch: source locator, extraction path and transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub source: DataSource,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub transform: Transform,
}

impl RequestPayload {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            path: None,
            transform: Transform::default(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Structural validation performed at submission time
    pub fn check(&self) -> Result<(), String> {
        match &self.source {
            DataSource::HttpJson { url } | DataSource::HttpText { url } => {
                let parsed = Url::parse(url).map_err(|e| format!("invalid url {url}: {e}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!("unsupported url scheme: {}", parsed.scheme()));
                }
            }
            DataSource::Inline { .. } => {}
        }

        if let Some(path) = &self.path {
            if path.trim().is_empty() {
                return Err("extraction path must not be empty".to_string());
            }
            if matches!(self.source, DataSource::HttpText { .. }) {
                return Err("text sources do not support an extraction path".to_string());
            }
        }

        if let Some(decimals) = self.transform.decimals {
            if decimals > 28 {
                return Err(format!("decimals must be at most 28, got {decimals}"));
            }
        }

        if self.transform.kind != ValueKind::Numeric
            && (self.transform.multiplier.is_some() || self.transform.decimals.is_some())
        {
            return Err("scaling applies to numeric values only".to_string());
        }

        Ok(())
    }
}

/// A unit of work tracked through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: RequestPayload,
    pub requester: String,
    pub callback: String,
    pub fee_reserved: Amount,
    pub state: RequestState,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}
