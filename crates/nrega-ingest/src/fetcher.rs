//! Upstream retrieval
//!
//! One GET per call, bounded by a timeout, no retries. Retry policy lives in
//! the scheduler so that backoff state is in one place.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::models::RawPayload;

/// Default `User-Agent` sent upstream
pub const DEFAULT_USER_AGENT: &str = "MGNREGA-Backend-Service";

/// Default fetch timeout in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Source of raw upstream payloads
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Perform one retrieval attempt
    async fn fetch(&self) -> Result<RawPayload, FetchError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// HTTP(S) fetcher configuration
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub source_uri: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl FetcherConfig {
    pub fn new(source_uri: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Fetches the upstream payload over HTTP(S)
pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        // no client-wide timeouts: each call carries its own bound
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// GET `uri`, returning the body or a classified error within `timeout`
    ///
    /// `timeout` bounds the whole call, connect included, independently of
    /// the configured default.
    pub async fn fetch_uri(&self, uri: &str, timeout: Duration) -> Result<RawPayload, FetchError> {
        debug!(uri = %uri, timeout_ms = timeout.as_millis() as u64, "Fetching upstream payload");

        // reqwest's per-request timeout covers connect + body; the outer bound
        // also covers anything reqwest does not account for.
        match tokio::time::timeout(timeout, self.request(uri, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(uri = %uri, "Upstream fetch timed out");
                Err(FetchError::Timeout(timeout))
            },
        }
    }

    async fn request(&self, uri: &str, timeout: Duration) -> Result<RawPayload, FetchError> {
        let response = self
            .client
            .get(uri)
            .timeout(timeout)
            .header(header::ACCEPT, "application/json, text/csv;q=0.9, */*;q=0.1")
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            warn!(uri = %uri, status = status.as_u16(), "Upstream returned error status");
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.map_err(|e| classify(e, timeout))?;

        info!(uri = %uri, bytes = body.len(), "Upstream payload fetched");

        Ok(RawPayload {
            body: body.to_vec(),
            content_type,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl PayloadSource for HttpFetcher {
    async fn fetch(&self) -> Result<RawPayload, FetchError> {
        self.fetch_uri(&self.config.source_uri, self.config.timeout)
            .await
    }

    fn describe(&self) -> String {
        self.config.source_uri.clone()
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if let Some(status) = err.status() {
        FetchError::HttpStatus(status.as_u16())
    } else {
        FetchError::Network(err.to_string())
    }
}
