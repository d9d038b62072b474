// =============================================================================
// insurance/captcha.rs — PAYING A STRANGER TO CLICK ON TRAFFIC LIGHTS
// =============================================================================
//
// The L&I search form is guarded by a reCAPTCHA. We hand its site key to a
// 2Captcha-compatible solving service, then poll until a human somewhere
// has identified enough crosswalks.
//
// Outcome policy:
//   - solved                          -> token
//   - still not ready after max_wait  -> retry the whole submission
//   - submission or transport failure -> retry the whole submission
//   - the service explicitly gives up -> terminal, no retry
// Outer attempts are capped and separated by a fixed backoff.
// =============================================================================

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;

/// The literal the service uses for "ask again later". Yes, it is misspelled.
pub const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Solved(String),
    NotReady,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptchaError {
    #[error("2Captcha submission failed: {0}")]
    Submit(String),

    #[error("2Captcha request failed: {0}")]
    Transport(String),

    #[error("2Captcha solving failed: {0}")]
    Rejected(String),

    #[error("2Captcha timeout after {0} seconds")]
    Timeout(u64),

    #[error("2Captcha failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl CaptchaError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptchaError::Submit(_) | CaptchaError::Transport(_) | CaptchaError::Timeout(_)
        )
    }
}

#[async_trait]
pub trait CaptchaBackend: Send + Sync {
    /// Submit a reCAPTCHA task, returning the service's request id.
    async fn submit(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError>;

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError>;
}

/// The 2Captcha `in.php` / `res.php` HTTP API.
pub struct TwoCaptcha {
    client: reqwest::Client,
    api_key: String,
    submit_url: String,
    result_url: String,
}

impl TwoCaptcha {
    pub fn new(config: &Config) -> Result<Self, CaptchaError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.captcha_api_key.clone(),
            submit_url: config.captcha_submit_url.clone(),
            result_url: config.captcha_result_url.clone(),
        })
    }
}

/// `{"status": 1, "request": "..."}` — status 1 means the request field
/// carries the payload, anything else means it carries an error code.
fn envelope(body: &Value) -> (bool, String) {
    let ok = body.get("status").and_then(Value::as_i64) == Some(1);
    let request = match body.get("request") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    (ok, request)
}

#[async_trait]
impl CaptchaBackend for TwoCaptcha {
    async fn submit(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let body: Value = self
            .client
            .post(&self.submit_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("method", "userrecaptcha"),
                ("googlekey", site_key),
                ("pageurl", page_url),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;

        match envelope(&body) {
            (true, id) if !id.is_empty() => Ok(id),
            (_, reason) => Err(CaptchaError::Submit(reason)),
        }
    }

    async fn poll(&self, request_id: &str) -> Result<PollStatus, CaptchaError> {
        let body: Value = self
            .client
            .get(&self.result_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("action", "get"),
                ("id", request_id),
                ("json", "1"),
            ])
            .send()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| CaptchaError::Transport(e.to_string()))?;

        Ok(match envelope(&body) {
            (true, token) => PollStatus::Solved(token),
            (false, code) if code == NOT_READY => PollStatus::NotReady,
            (false, code) => PollStatus::Rejected(code),
        })
    }
}

/// Submit-and-poll loop with bounded outer retries.
pub struct CaptchaSolver {
    backend: Arc<dyn CaptchaBackend>,
    poll_interval: Duration,
    max_wait: Duration,
    attempts: u32,
    backoff: Duration,
}

impl CaptchaSolver {
    pub fn new(backend: Arc<dyn CaptchaBackend>, config: &Config) -> Self {
        Self {
            backend,
            poll_interval: config.captcha_poll_interval,
            max_wait: config.captcha_max_wait,
            attempts: config.captcha_attempts.max(1),
            backoff: config.captcha_backoff,
        }
    }

    pub async fn solve(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let mut last = None;
        for attempt in 1..=self.attempts {
            info!(attempt = attempt, "Submitting reCAPTCHA to solver");
            match self.attempt(site_key, page_url).await {
                Ok(token) => return Ok(token),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Solver attempt failed");
                    last = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }
        Err(CaptchaError::Exhausted {
            attempts: self.attempts,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn attempt(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let request_id = self.backend.submit(site_key, page_url).await?;
        let started = Instant::now();
        loop {
            if started.elapsed() > self.max_wait {
                return Err(CaptchaError::Timeout(self.max_wait.as_secs()));
            }
            match self.backend.poll(&request_id).await? {
                PollStatus::Solved(token) => {
                    info!(elapsed_secs = started.elapsed().as_secs(), "reCAPTCHA solved");
                    return Ok(token);
                }
                PollStatus::Rejected(code) => return Err(CaptchaError::Rejected(code)),
                PollStatus::NotReady => {
                    debug!(request_id = %request_id, "Solver not ready yet");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}
