use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;

use super::HttpMethod;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "Idempotent-Replayed";

/// Transport-level failures. HTTP error statuses are not errors here; they
/// come back as a [`RemoteResponse`] and the outbox classifies them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Value>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    /// Server reported that this idempotency key was already applied.
    pub idempotent_replayed: bool,
}

impl RemoteResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            idempotent_replayed: false,
        }
    }

    pub fn replayed(status: u16) -> Self {
        Self {
            status,
            idempotent_replayed: true,
        }
    }
}

/// The remote API the outbox replays into.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError>;
}

/// `reqwest` client for the REST API. Entry URLs are resolved against
/// `base_url` unless they are already absolute.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn send(&self, request: &RemoteRequest) -> Result<RemoteResponse, RemoteError> {
        let mut builder = self
            .client
            .request(method(request.method), self.resolve(&request.url))
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteError::Timeout
            } else if e.is_builder() {
                RemoteError::InvalidRequest(e.to_string())
            } else {
                RemoteError::Network(e.to_string())
            }
        })?;

        let idempotent_replayed = response
            .headers()
            .get(IDEMPOTENT_REPLAYED_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Ok(RemoteResponse {
            status: response.status().as_u16(),
            idempotent_replayed,
        })
    }
}
