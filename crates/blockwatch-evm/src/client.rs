//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! The client performs single attempts only. Retries and timeouts are applied
//! by the block processor around every block source call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use blockwatch_core::error::WatchError;

use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// Something that can answer JSON-RPC calls.
#[async_trait]
pub trait JsonRpcClient: Send + Sync {
    /// Call `method` and return its `result` (possibly `Null`).
    ///
    /// Transport failures map to [`WatchError::Source`] (retryable); errors
    /// returned by the node map to [`WatchError::Other`].
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WatchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, WatchError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WatchError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, WatchError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, WatchError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| WatchError::Source(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(WatchError::Source(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| WatchError::Source(e.to_string()))
    }
}

#[async_trait]
impl JsonRpcClient for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WatchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        tracing::trace!(id, method, url = %self.url, "json-rpc call");
        self.send(&req)
            .await?
            .into_result()
            .map_err(|e| WatchError::Other(format!("{method}: {e}")))
    }
}
