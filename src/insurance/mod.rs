// =============================================================================
// insurance/mod.rs — THE L&I INSURANCE SCRAPER
// =============================================================================
//
// Eight steps, strictly in order, each with its own wait budget:
//
//   OpenSearchPage -> EnterDocket -> SolveCaptcha -> SubmitSearch
//     -> RequestHtml -> OpenActiveInsurance -> AwaitResults -> ParseResults
//
// Any step failing ends the scrape with an error tagged by the step that
// failed. Whatever happens, the browser is closed before we return.
// A shutdown signal is honored at every step boundary and during waits.
// =============================================================================

pub mod captcha;
pub mod portal;
pub mod table;

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::ScrapeOutcome;
use captcha::{CaptchaError, CaptchaSolver};
use portal::{DriverError, PortalDriver};
use table::TableError;

const DOCKET_INPUT: &str = "input[name='n_docketno']";
const RECAPTCHA: &str = ".g-recaptcha";
const SEARCH_BUTTON: &str = "input[type='submit'][value*='Search']";
const HTML_BUTTON: &str = "input[type='submit'][value='HTML']";
const ACTIVE_INSURANCE_FORM: &str = "form[action*='prc_activeinsurance']";
const ACTIVE_INSURANCE_PATH: &str = "prc_activeinsurance";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeState {
    OpenSearchPage,
    EnterDocket,
    SolveCaptcha,
    SubmitSearch,
    RequestHtml,
    OpenActiveInsurance,
    AwaitResults,
    ParseResults,
}

impl ScrapeState {
    pub const SEQUENCE: [ScrapeState; 8] = [
        ScrapeState::OpenSearchPage,
        ScrapeState::EnterDocket,
        ScrapeState::SolveCaptcha,
        ScrapeState::SubmitSearch,
        ScrapeState::RequestHtml,
        ScrapeState::OpenActiveInsurance,
        ScrapeState::AwaitResults,
        ScrapeState::ParseResults,
    ];
}

impl fmt::Display for ScrapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScrapeState::OpenSearchPage => "open_search_page",
            ScrapeState::EnterDocket => "enter_docket",
            ScrapeState::SolveCaptcha => "solve_captcha",
            ScrapeState::SubmitSearch => "submit_search",
            ScrapeState::RequestHtml => "request_html",
            ScrapeState::OpenActiveInsurance => "open_active_insurance",
            ScrapeState::AwaitResults => "await_results",
            ScrapeState::ParseResults => "parse_results",
        };
        f.write_str(name)
    }
}

/// Wait budget for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    /// Longest we wait for the step's page element.
    pub wait: Duration,
    /// Pause after the step succeeds.
    pub settle: Duration,
    /// Extra tries for steps that are safe to repeat.
    pub retries: u32,
}

impl StepPolicy {
    pub fn for_state(state: ScrapeState, config: &Config) -> Self {
        let step = StepPolicy {
            wait: config.step_wait,
            settle: config.step_settle,
            retries: 0,
        };
        match state {
            ScrapeState::OpenSearchPage => StepPolicy { retries: 1, ..step },
            ScrapeState::AwaitResults => StepPolicy {
                wait: config.results_wait,
                settle: config.results_settle,
                retries: 1,
            },
            ScrapeState::ParseResults => StepPolicy { settle: Duration::ZERO, ..step },
            _ => step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScrapeError {
    #[error("{state}: {source}")]
    Driver {
        state: ScrapeState,
        #[source]
        source: DriverError,
    },

    #[error("{state}: {source}")]
    Captcha {
        state: ScrapeState,
        #[source]
        source: CaptchaError,
    },

    #[error("{state}: {reason}")]
    Page { state: ScrapeState, reason: String },

    #[error(transparent)]
    Table(#[from] TableError),

    #[error("shutdown requested during {0}")]
    Interrupted(ScrapeState),
}

impl ScrapeError {
    pub fn state(&self) -> ScrapeState {
        match self {
            ScrapeError::Driver { state, .. }
            | ScrapeError::Captcha { state, .. }
            | ScrapeError::Page { state, .. }
            | ScrapeError::Interrupted(state) => *state,
            ScrapeError::Table(_) => ScrapeState::ParseResults,
        }
    }

    /// The message that goes into `[{"error": ...}]`.
    pub fn outcome_message(&self) -> String {
        match self {
            ScrapeError::Table(e) => e.to_string(),
            other => format!("Unexpected error: {}", other),
        }
    }
}

pub struct InsuranceScraper<D: PortalDriver> {
    driver: D,
    solver: CaptchaSolver,
    portal_url: String,
    /// Indexed by `ScrapeState as usize`.
    policies: [StepPolicy; ScrapeState::SEQUENCE.len()],
    shutdown: watch::Receiver<bool>,
}

impl<D: PortalDriver> InsuranceScraper<D> {
    pub fn new(driver: D, solver: CaptchaSolver, config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            driver,
            solver,
            portal_url: config.portal_url.clone(),
            policies: ScrapeState::SEQUENCE.map(|s| StepPolicy::for_state(s, config)),
            shutdown,
        }
    }

    fn policy(&self, state: ScrapeState) -> StepPolicy {
        self.policies[state as usize]
    }

    /// Run the full flow for one MC number. The driver is closed on every
    /// path out of here.
    pub async fn run(mut self, mc_number: &str) -> ScrapeOutcome {
        let result = self.drive(mc_number).await;
        if let Err(e) = self.driver.close().await {
            warn!(mc_number = mc_number, error = %e, "Browser teardown failed");
        }
        match result {
            Ok(outcome) => {
                info!(mc_number = mc_number, usable = outcome.is_usable(), "Insurance scrape finished");
                outcome
            }
            Err(e) => {
                error!(mc_number = mc_number, state = %e.state(), error = %e, "Insurance scrape failed");
                ScrapeOutcome::Failed(e.outcome_message())
            }
        }
    }

    async fn drive(&mut self, mc_number: &str) -> Result<ScrapeOutcome, ScrapeError> {
        let mut shutdown = self.shutdown.clone();
        for state in ScrapeState::SEQUENCE {
            if *shutdown.borrow() {
                return Err(ScrapeError::Interrupted(state));
            }
            let policy = self.policy(state);
            info!(mc_number = mc_number, step = %state, "Portal step");

            if state == ScrapeState::ParseResults {
                let html = self
                    .driver
                    .html()
                    .await
                    .map_err(|source| ScrapeError::Driver { state, source })?;
                return Ok(table::parse_insurance_page(&html)?);
            }

            let mut tries = 0;
            loop {
                let outcome = tokio::select! {
                    r = self.step(state, policy, mc_number) => r,
                    _ = shutdown_requested(&mut shutdown) => return Err(ScrapeError::Interrupted(state)),
                };
                match outcome {
                    Ok(()) => break,
                    Err(ScrapeError::Driver { source, .. }) if tries < policy.retries => {
                        tries += 1;
                        warn!(step = %state, error = %source, "Step failed, retrying");
                    }
                    Err(e) => return Err(e),
                }
            }

            if !policy.settle.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(policy.settle) => {}
                    _ = shutdown_requested(&mut shutdown) => return Err(ScrapeError::Interrupted(state)),
                }
            }
        }
        Err(ScrapeError::Page {
            state: ScrapeState::ParseResults,
            reason: "portal flow ended without a results page".to_string(),
        })
    }

    async fn step(&mut self, state: ScrapeState, policy: StepPolicy, mc_number: &str) -> Result<(), ScrapeError> {
        let driver_err = |source| ScrapeError::Driver { state, source };
        match state {
            ScrapeState::OpenSearchPage => {
                let url = self.portal_url.clone();
                self.driver.goto(&url).await.map_err(driver_err)
            }
            ScrapeState::EnterDocket => {
                self.driver.wait_for(DOCKET_INPUT, policy.wait).await.map_err(driver_err)?;
                self.driver.type_into(DOCKET_INPUT, mc_number).await.map_err(driver_err)
            }
            ScrapeState::SolveCaptcha => self.solve_captcha(state, policy).await,
            ScrapeState::SubmitSearch => {
                self.driver.wait_for(SEARCH_BUTTON, policy.wait).await.map_err(driver_err)?;
                self.driver.click(SEARCH_BUTTON).await.map_err(driver_err)
            }
            ScrapeState::RequestHtml => {
                self.driver.wait_for(HTML_BUTTON, policy.wait).await.map_err(driver_err)?;
                self.driver.click(HTML_BUTTON).await.map_err(driver_err)
            }
            ScrapeState::OpenActiveInsurance => {
                self.driver
                    .wait_for(ACTIVE_INSURANCE_FORM, policy.wait)
                    .await
                    .map_err(driver_err)?;
                let script = format!(
                    "(() => {{ const f = document.querySelector({}); if (!f) return false; f.submit(); return true; }})()",
                    js_string(ACTIVE_INSURANCE_FORM)
                );
                match self.driver.evaluate(&script).await.map_err(driver_err)? {
                    serde_json::Value::Bool(true) => Ok(()),
                    _ => Err(ScrapeError::Page {
                        state,
                        reason: "active/pending insurance form disappeared".to_string(),
                    }),
                }
            }
            ScrapeState::AwaitResults => {
                self.driver
                    .wait_for_url(ACTIVE_INSURANCE_PATH, policy.wait)
                    .await
                    .map_err(driver_err)?;
                self.driver.wait_for("table", policy.wait).await.map_err(driver_err)
            }
            ScrapeState::ParseResults => Ok(()),
        }
    }

    async fn solve_captcha(&mut self, state: ScrapeState, policy: StepPolicy) -> Result<(), ScrapeError> {
        let driver_err = |source| ScrapeError::Driver { state, source };
        let page_err = |reason: &str| ScrapeError::Page {
            state,
            reason: reason.to_string(),
        };

        self.driver.wait_for(RECAPTCHA, policy.wait).await.map_err(driver_err)?;
        let site_key = self
            .driver
            .attribute(RECAPTCHA, "data-sitekey")
            .await
            .map_err(driver_err)?
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| page_err("reCAPTCHA site key not found"))?;
        let page_url = self.driver.current_url().await.map_err(driver_err)?;

        let token = self
            .solver
            .solve(&site_key, &page_url)
            .await
            .map_err(|source| ScrapeError::Captcha { state, source })?;
        let token_js = js_string(&token);

        let inject = format!(
            "(() => {{ const el = document.getElementById('g-recaptcha-response'); if (!el) return false; \
             el.innerHTML = {t}; el.value = {t}; return true; }})()",
            t = token_js
        );
        if self.driver.evaluate(&inject).await.map_err(driver_err)? != serde_json::Value::Bool(true) {
            return Err(page_err("reCAPTCHA response field not found"));
        }

        match self.driver.attribute(RECAPTCHA, "data-callback").await.map_err(driver_err)? {
            Some(callback) if is_js_identifier(&callback) => {
                self.driver
                    .evaluate(&format!("(() => {{ {}({}); return true; }})()", callback, token_js))
                    .await
                    .map_err(driver_err)?;
            }
            Some(callback) => warn!(callback = %callback, "Ignoring reCAPTCHA callback with an odd name"),
            None => warn!("No reCAPTCHA callback declared, continuing without it"),
        }

        let verified = self
            .driver
            .evaluate("(document.getElementsByName('g-recaptcha-response')[0] || {}).value || ''")
            .await
            .map_err(driver_err)?;
        match verified.as_str() {
            Some(v) if !v.is_empty() => Ok(()),
            _ => Err(page_err("reCAPTCHA verification failed after 2Captcha solution")),
        }
    }
}

/// Resolves once shutdown is flagged. Never resolves if the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}
