// =============================================================================
// insurance/portal.rs — DRIVING A REAL BROWSER AT A 1990s WEBSITE
// =============================================================================
//
// The L&I portal has no API. It has forms, submit buttons with padded
// labels, and a reCAPTCHA. So we launch headless Chrome over the DevTools
// protocol and click through it like a very patient freight agent.
//
// `PortalDriver` is the handful of browser verbs the scraper needs. The
// Chrome implementation lives here; the scraper's tests use a scripted fake.
// =============================================================================

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";

/// Runs before any portal script so the page doesn't see an automated browser.
const WEBDRIVER_MASK: &str = "Object.defineProperty(navigator, 'webdriver', { get: () => false });";

const POLL_EVERY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("element '{selector}' did not appear within {waited_ms}ms")]
    ElementMissing { selector: String, waited_ms: u128 },

    #[error("page script failed: {0}")]
    Script(String),

    #[error("browser error: {0}")]
    Browser(String),
}

#[async_trait]
pub trait PortalDriver: Send {
    async fn goto(&mut self, url: &str) -> Result<(), DriverError>;

    /// Block until `selector` matches something, or `wait` runs out.
    async fn wait_for(&mut self, selector: &str, wait: Duration) -> Result<(), DriverError>;

    /// Block until the current URL contains `fragment`, or `wait` runs out.
    async fn wait_for_url(&mut self, fragment: &str, wait: Duration) -> Result<(), DriverError>;

    async fn type_into(&mut self, selector: &str, text: &str) -> Result<(), DriverError>;

    async fn click(&mut self, selector: &str) -> Result<(), DriverError>;

    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>, DriverError>;

    /// Evaluate a JS expression and return its JSON value.
    async fn evaluate(&mut self, script: &str) -> Result<Value, DriverError>;

    async fn current_url(&mut self) -> Result<String, DriverError>;

    async fn html(&mut self) -> Result<String, DriverError>;

    /// Tear the session down. Must be safe to call more than once.
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Headless Chrome over CDP.
pub struct ChromePortal {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    profile_dir: PathBuf,
}

impl ChromePortal {
    pub async fn launch(config: &Config) -> Result<Self, DriverError> {
        // Foreground and background scrapes for the same carrier run at the
        // same time, so each browser gets its own profile directory.
        let profile_dir = std::env::temp_dir().join(format!("carrier-intel-{}", uuid::Uuid::new_v4()));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(&profile_dir)
            .args(vec![
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--disable-extensions".to_string(),
                "--disable-blink-features=AutomationControlled".to_string(),
                format!("--user-agent={}", USER_AGENT),
            ]);
        if let Some(chrome) = &config.chrome_executable {
            builder = builder.chrome_executable(chrome);
        }
        let browser_config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler stopped");
                    break;
                }
            }
        });

        let mut portal = Self {
            browser: Some(browser),
            handler: Some(handler),
            page: None,
            profile_dir,
        };

        let page = match portal.browser.as_ref() {
            Some(browser) => browser
                .new_page("about:blank")
                .await
                .map_err(|e| DriverError::Launch(e.to_string())),
            None => Err(DriverError::Launch("browser vanished during launch".to_string())),
        };
        let page = match page {
            Ok(page) => page,
            Err(e) => {
                let _ = portal.close().await;
                return Err(e);
            }
        };
        if let Err(e) = page.execute(AddScriptToEvaluateOnNewDocumentParams::new(WEBDRIVER_MASK)).await {
            warn!(error = %e, "Could not mask navigator.webdriver");
        }
        portal.page = Some(page);

        info!("Headless Chrome launched");
        Ok(portal)
    }

    fn page(&self) -> Result<&Page, DriverError> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::Browser("session already closed".to_string()))
    }
}

#[async_trait]
impl PortalDriver for ChromePortal {
    async fn goto(&mut self, url: &str) -> Result<(), DriverError> {
        self.page()?
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, wait: Duration) -> Result<(), DriverError> {
        let page = self.page()?;
        let deadline = Instant::now() + wait;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::ElementMissing {
                    selector: selector.to_string(),
                    waited_ms: wait.as_millis(),
                });
            }
            tokio::time::sleep(POLL_EVERY).await;
        }
    }

    async fn wait_for_url(&mut self, fragment: &str, wait: Duration) -> Result<(), DriverError> {
        let page = self.page()?;
        let deadline = Instant::now() + wait;
        loop {
            let url = page
                .url()
                .await
                .map_err(|e| DriverError::Browser(e.to_string()))?
                .unwrap_or_default();
            if url.contains(fragment) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Navigation {
                    url: fragment.to_string(),
                    reason: format!("still on {} after {}ms", url, wait.as_millis()),
                });
            }
            tokio::time::sleep(POLL_EVERY).await;
        }
    }

    async fn type_into(&mut self, selector: &str, text: &str) -> Result<(), DriverError> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        element
            .type_str(text)
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), DriverError> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        Ok(())
    }

    async fn attribute(&mut self, selector: &str, name: &str) -> Result<Option<String>, DriverError> {
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?;
        element
            .attribute(name)
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))
    }

    async fn evaluate(&mut self, script: &str) -> Result<Value, DriverError> {
        self.page()?
            .evaluate(script)
            .await
            .map_err(|e| DriverError::Script(e.to_string()))?
            .into_value()
            .map_err(|e| DriverError::Script(e.to_string()))
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        Ok(self
            .page()?
            .url()
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))?
            .unwrap_or_default())
    }

    async fn html(&mut self) -> Result<String, DriverError> {
        self.page()?
            .content()
            .await
            .map_err(|e| DriverError::Browser(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Chrome did not close cleanly, killing it");
                let _ = browser.kill().await;
            }
            let _ = browser.wait().await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        if let Err(e) = std::fs::remove_dir_all(&self.profile_dir) {
            debug!(error = %e, dir = %self.profile_dir.display(), "Profile directory not removed");
        }
        Ok(())
    }
}
