// =============================================================================
// lookup/dataset_client.rs — THE DOT CENSUS, FOR CONTACT DETAILS
// =============================================================================
//
// QCMobile doesn't hand out email addresses or officer names. The DOT's
// Socrata census dataset does, keyed by USDOT number. Nothing here is ever
// fatal: a missing row, a 500 or garbage JSON all just mean the contact
// fields stay absent.
// =============================================================================

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::fmcsa_client::text;
use super::http::HttpJson;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;

/// The handful of census columns we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CensusRecord {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company_officer: Option<String>,
    /// `docket1` with the "MC" prefix stripped.
    pub mc_number: Option<String>,
}

pub struct DatasetClient {
    http: Arc<dyn HttpJson>,
    dataset_url: String,
    pause: Duration,
    breaker: CircuitBreaker,
}

impl DatasetClient {
    pub fn new(http: Arc<dyn HttpJson>, config: &Config) -> Self {
        Self {
            http,
            dataset_url: config.dataset_url.clone(),
            pause: config.request_pause,
            breaker: CircuitBreaker::from_config("dot-census", config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn census(&self, dot_number: &str) -> CensusRecord {
        if !self.breaker.allow_request() {
            warn!(dot_number = dot_number, "Census: circuit open, skipping contact details");
            return CensusRecord::default();
        }
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }

        let url = match url::Url::parse_with_params(&self.dataset_url, &[("dot_number", dot_number)]) {
            Ok(url) => url,
            Err(e) => {
                warn!(dataset_url = %self.dataset_url, error = %e, "Census: dataset URL is unusable");
                return CensusRecord::default();
            }
        };
        let body = match self.http.get_json(url.as_str()).await {
            Ok(body) => {
                self.breaker.record_success();
                body
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(dot_number = dot_number, error = %e, "Census: request failed, contact fields stay absent");
                return CensusRecord::default();
            }
        };

        let row = match body.as_array().and_then(|rows| rows.first()).and_then(Value::as_object) {
            Some(row) => row,
            None => {
                debug!(dot_number = dot_number, "Census: no row for this carrier");
                return CensusRecord::default();
            }
        };

        CensusRecord {
            phone: text(row, "phone"),
            email: text(row, "email_address"),
            company_officer: text(row, "company_officer_1"),
            mc_number: text(row, "docket1")
                .map(|docket| docket.replace("MC", "").trim().to_string())
                .filter(|mc| !mc.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::http::fake::FakeHttp;
    use crate::lookup::http::FetchError;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_first_row() {
        let http = Arc::new(FakeHttp::new().route(
            "dot_number=1234567",
            Ok(json!([
                {
                    "phone": "5559876543",
                    "email_address": "DISPATCH@ACME.TEST",
                    "company_officer_1": "JANE ROE",
                    "docket1": "MC123456"
                },
                { "phone": "0000000000" }
            ])),
        ));
        let client = DatasetClient::new(http.clone(), &Config::for_tests());

        let record = client.census("1234567").await;
        assert_eq!(record.phone.as_deref(), Some("5559876543"));
        assert_eq!(record.email.as_deref(), Some("DISPATCH@ACME.TEST"));
        assert_eq!(record.company_officer.as_deref(), Some("JANE ROE"));
        assert_eq!(record.mc_number.as_deref(), Some("123456"));
        assert!(http.calls()[0].starts_with("https://dataset.test/resource/az4n-8mr2.json?dot_number="));
    }

    #[tokio::test]
    async fn test_failures_degrade_to_empty() {
        let cases = [
            Ok(json!([])),
            Ok(json!({ "error": true })),
            Err(FetchError::Status(500)),
            Err(FetchError::Malformed("<html>".into())),
        ];
        for response in cases {
            let http = Arc::new(FakeHttp::new().route("dot_number=", response));
            let client = DatasetClient::new(http, &Config::for_tests());
            assert_eq!(client.census("1").await, CensusRecord::default());
        }
    }
}
