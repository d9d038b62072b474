// =============================================================================
// lookup/http.rs — GET SOME JSON, PLEASE
// =============================================================================
//
// The narrowest possible seam between the lookup clients and the network:
// "here is a URL, give me the JSON body or tell me what went wrong". The
// production implementation is reqwest; tests swap in a fake that counts
// calls and serves canned bodies.
// =============================================================================

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA, REFERER};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    /// Connection refused, DNS, TLS, timeout. Anything before a status line.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("upstream answered HTTP {0}")]
    Status(u16),

    /// 2xx, but the body does not parse as JSON.
    #[error("response body is not JSON: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait HttpJson: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError>;
}

/// reqwest-backed client with the headers QCMobile expects from a browser.
pub struct ReqwestJson {
    client: reqwest::Client,
}

impl ReqwestJson {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(REFERER, HeaderValue::from_static("https://mobile.fmcsa.dot.gov/"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent("Mozilla/5.0")
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpJson for ReqwestJson {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        debug!(bytes = body.len(), "Upstream body received");
        serde_json::from_str(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}
