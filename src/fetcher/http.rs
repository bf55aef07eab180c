use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{Fetcher, RawDocument};
use crate::error::FetchError;
use crate::models::DataSource;

pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Fetcher backed by an HTTP client. Inline sources are served locally.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    max_response_bytes: usize,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESPONSE_BYTES)
    }
}

impl HttpFetcher {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            http: Client::new(),
            max_response_bytes,
        }
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(timeout, self.download(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut response = self.http.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("HTTP {status} from {url}")));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_response_bytes as u64 {
                return Err(FetchError::MalformedResponse(format!(
                    "response of {length} bytes exceeds limit of {}",
                    self.max_response_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(FetchError::MalformedResponse(format!(
                    "response exceeds limit of {} bytes",
                    self.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn retrieve(
        &self,
        source: &DataSource,
        timeout: Duration,
    ) -> Result<RawDocument, FetchError> {
        match source {
            DataSource::Inline { body } => Ok(RawDocument::Json(body.clone())),
            DataSource::HttpJson { url } => {
                let body = self.get(url, timeout).await?;
                serde_json::from_slice(&body)
                    .map(RawDocument::Json)
                    .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {e}")))
            }
            DataSource::HttpText { url } => {
                let body = self.get(url, timeout).await?;
                String::from_utf8(body)
                    .map(RawDocument::Text)
                    .map_err(|_| FetchError::MalformedResponse("body is not UTF-8".to_string()))
            }
        }
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_decode() || err.is_body() {
        FetchError::MalformedResponse(err.to_string())
    } else if err.is_timeout() {
        FetchError::Timeout(0)
    } else {
        FetchError::Unreachable(err.to_string())
    }
}
