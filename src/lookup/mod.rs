// =============================================================================
// lookup/mod.rs — THE CARRIER PROFILE AGGREGATOR
// =============================================================================
//
// One lookup, two government sources:
//
//   1. QCMobile, by MC or DOT number: registration, safety, authority.
//   2. The DOT census dataset, by the USDOT number QCMobile resolved:
//      phone, email, company officer, and an MC number if QCMobile had none.
//
// Nothing is cached and nothing is retried. Ask twice, pay twice.
// =============================================================================

pub mod dataset_client;
pub mod fmcsa_client;
pub mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::models::{labels, Absent, CarrierProfile};
use crate::normalize::format_phone_number;
use dataset_client::DatasetClient;
use fmcsa_client::FmcsaClient;
use http::HttpJson;

/// The identifier a lookup was made with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Mc(String),
    Dot(String),
}

impl Identifier {
    pub fn value(&self) -> &str {
        match self {
            Identifier::Mc(v) | Identifier::Dot(v) => v,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Mc(v) => write!(f, "MC number {}", v),
            Identifier::Dot(v) => write!(f, "DOT number {}", v),
        }
    }
}

/// Why a lookup produced no profile. Display strings are shown to users
/// as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Please enter either an MC number or a DOT number, not both.")]
    BothIdentifiers,

    #[error("Please enter an MC number or a DOT number to search.")]
    NoIdentifier,

    #[error("No data found for {0}.")]
    NoData(Identifier),

    #[error("Invalid structure for {0}.")]
    InvalidStructure(Identifier),

    #[error("Unable to retrieve USDOT number for {0}.")]
    MissingUsdot(Identifier),

    /// Transport failure, non-2xx or open breaker. The cause is only logged.
    #[error("API error occurred")]
    Api,
}

impl LookupError {
    /// Caller mistakes, as opposed to upstream trouble.
    pub fn is_input_error(&self) -> bool {
        matches!(self, LookupError::BothIdentifiers | LookupError::NoIdentifier)
    }
}

/// Pick the single identifier a request carries. Blank counts as absent.
pub fn resolve_identifier(mc: Option<&str>, dot: Option<&str>) -> Result<Identifier, LookupError> {
    let clean = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
    match (clean(mc), clean(dot)) {
        (Some(_), Some(_)) => Err(LookupError::BothIdentifiers),
        (Some(mc), None) => Ok(Identifier::Mc(mc)),
        (None, Some(dot)) => Ok(Identifier::Dot(dot)),
        (None, None) => Err(LookupError::NoIdentifier),
    }
}

pub struct Aggregator {
    fmcsa: FmcsaClient,
    dataset: DatasetClient,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Aggregator {
    pub fn new(http: Arc<dyn HttpJson>, config: &Config) -> Self {
        Self {
            fmcsa: FmcsaClient::new(http.clone(), config),
            dataset: DatasetClient::new(http, config),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn breakers(&self) -> [&crate::circuit_breaker::CircuitBreaker; 2] {
        [self.fmcsa.breaker(), self.dataset.breaker()]
    }

    /// Assemble a carrier profile from exactly one of `mc` / `dot`.
    pub async fn lookup(
        &self,
        mc: Option<&str>,
        dot: Option<&str>,
        access_key: &str,
    ) -> Result<CarrierProfile, LookupError> {
        let result = self.lookup_inner(mc, dot, access_key).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_lookup(result.is_ok());
        }
        result
    }

    async fn lookup_inner(
        &self,
        mc: Option<&str>,
        dot: Option<&str>,
        access_key: &str,
    ) -> Result<CarrierProfile, LookupError> {
        let id = resolve_identifier(mc, dot)?;
        let primary = self.fmcsa.carrier(&id, access_key).await?;
        let census = self.dataset.census(&primary.dot_number).await;

        let mut profile = primary.profile;
        profile.set_if_present(
            labels::PHONE,
            census.phone.map(|p| format_phone_number(&p)),
            Absent::NotApplicable,
        );
        profile.set(labels::EMAIL, census.email, Absent::NotAvailable);
        profile.set(labels::COMPANY_OFFICER, census.company_officer, Absent::NotApplicable);
        if profile.get(labels::MC_NUMBER).is_none() {
            profile.set(labels::MC_NUMBER, census.mc_number, Absent::NotApplicable);
        }

        info!(identifier = %id, dot_number = %primary.dot_number, "Carrier profile assembled");
        Ok(profile)
    }

    /// Lookup flattened to the token-keyed record handed to callers.
    pub async fn lookup_record(
        &self,
        mc: Option<&str>,
        dot: Option<&str>,
        access_key: &str,
    ) -> Result<BTreeMap<String, String>, LookupError> {
        self.lookup(mc, dot, access_key).await.map(|p| p.to_record())
    }
}
