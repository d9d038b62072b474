// =============================================================================
// lookup/fmcsa_client.rs — QCMOBILE, THE PRIMARY SOURCE OF TRUTH
// =============================================================================
//
// FMCSA's QCMobile API knows every carrier's registration, authority and
// inspection history. It also knows how to return the same carrier in three
// different JSON shapes depending on which endpoint you asked:
//
//   docket-number lookup:  { "content": [ { "carrier": {...}, "docketNumber": 123 } ] }
//   DOT lookup:            { "content": { "carrier": {...} } }
//   occasionally:          { "content": { ...the carrier itself... } }
//
// We accept all of them. Every call is preceded by a fixed pause because
// QCMobile throttles keys that ask too fast.
// =============================================================================

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::http::{FetchError, HttpJson};
use super::{Identifier, LookupError};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::models::{labels, Absent, CarrierProfile};
use crate::normalize::{format_phone_number, format_tax_ein};

/// Carrier fields copied straight across: (label, QCMobile key, absent as).
const CARRIER_FIELDS: &[(&str, &str, Absent)] = &[
    ("Out of Service", "outOfService", Absent::NotApplicable),
    ("Out of Service Date", "oosDate", Absent::None),
    ("Complaint Count", "complaintCount", Absent::NotApplicable),
    ("Total Drivers", "totalDrivers", Absent::NotApplicable),
    ("Total Power Units", "totalPowerUnits", Absent::NotApplicable),
    ("Crash Total", "crashTotal", Absent::NotApplicable),
    ("Fatal Crash", "fatalCrash", Absent::NotApplicable),
    ("Injury Crash", "injCrash", Absent::NotApplicable),
    ("Towaway Crash", "towawayCrash", Absent::NotApplicable),
    ("Driver Inspections", "driverInsp", Absent::NotApplicable),
    ("Driver OOS Inspections", "driverOosInsp", Absent::NotApplicable),
    ("Driver OOS Rate", "driverOosRate", Absent::NotApplicable),
    ("Driver OOS Rate National Average", "driverOosRateNationalAverage", Absent::NotApplicable),
    ("Vehicle Inspections", "vehicleInsp", Absent::NotApplicable),
    ("Vehicle OOS Inspections", "vehicleOosInsp", Absent::NotApplicable),
    ("Vehicle OOS Rate", "vehicleOosRate", Absent::NotApplicable),
    ("Vehicle OOS Rate National Average", "vehicleOosRateNationalAverage", Absent::NotApplicable),
    ("Hazmat Inspections", "hazmatInsp", Absent::NotApplicable),
    ("Insurance BIPD On File", "bipdInsuranceOnFile", Absent::NotApplicable),
    ("Insurance BIPD Required", "bipdInsuranceRequired", Absent::NotApplicable),
    ("Insurance BIPD Required Amount", "bipdRequiredAmount", Absent::NotApplicable),
    ("Insurance Cargo On File", "cargoInsuranceOnFile", Absent::NotApplicable),
    ("Insurance Cargo Required", "cargoInsuranceRequired", Absent::NotApplicable),
    ("Broker Authority Status", "brokerAuthorityStatus", Absent::NotApplicable),
    ("Common Authority Status", "commonAuthorityStatus", Absent::NotApplicable),
    ("Contract Authority Status", "contractAuthorityStatus", Absent::NotApplicable),
    ("Review Date", "reviewDate", Absent::None),
    ("Review Type", "reviewType", Absent::None),
    ("Safety Rating", "safetyRating", Absent::None),
    ("Safety Rating Date", "safetyRatingDate", Absent::None),
    ("Safety Review Date", "safetyReviewDate", Absent::None),
    ("Safety Review Type", "safetyReviewType", Absent::None),
    ("Status Code", "statusCode", Absent::NotApplicable),
];

/// A resolved primary lookup. The USDOT number is always present.
#[derive(Debug, Clone)]
pub struct PrimaryRecord {
    pub profile: CarrierProfile,
    pub dot_number: String,
}

pub struct FmcsaClient {
    http: Arc<dyn HttpJson>,
    base_url: String,
    pause: Duration,
    breaker: CircuitBreaker,
}

impl FmcsaClient {
    pub fn new(http: Arc<dyn HttpJson>, config: &Config) -> Self {
        Self {
            http,
            base_url: config.fmcsa_base_url.trim_end_matches('/').to_string(),
            pause: config.request_pause,
            breaker: CircuitBreaker::from_config("qcmobile", config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn carrier_url(&self, id: &Identifier, web_key: &str) -> String {
        let key = urlencoding::encode(web_key);
        match id {
            Identifier::Mc(mc) => format!(
                "{}/carriers/docket-number/{}/?webKey={}",
                self.base_url,
                urlencoding::encode(mc),
                key
            ),
            Identifier::Dot(dot) => format!(
                "{}/carriers/{}?webKey={}",
                self.base_url,
                urlencoding::encode(dot),
                key
            ),
        }
    }

    /// GET through the breaker, after the politeness pause.
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        if !self.breaker.allow_request() {
            return Err(FetchError::Transport("qcmobile circuit open".to_string()));
        }
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        match self.http.get_json(url).await {
            Ok(body) => {
                self.breaker.record_success();
                Ok(body)
            }
            Err(FetchError::Malformed(e)) => {
                self.breaker.record_success();
                Err(FetchError::Malformed(e))
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Resolve a carrier by MC or DOT number and build its profile. The
    /// authority status is fetched with a second call and is best effort.
    pub async fn carrier(&self, id: &Identifier, web_key: &str) -> Result<PrimaryRecord, LookupError> {
        info!(identifier = %id, "QCMobile: looking up carrier");

        let body = match self.fetch(&self.carrier_url(id, web_key)).await {
            Ok(body) => body,
            Err(FetchError::Malformed(e)) => {
                warn!(identifier = %id, error = %e, "QCMobile: body is not JSON");
                return Err(LookupError::InvalidStructure(id.clone()));
            }
            Err(e) => {
                error!(identifier = %id, error = %e, "QCMobile: carrier request failed");
                return Err(LookupError::Api);
            }
        };

        let element = match body.get("content") {
            None | Some(Value::Null) => return Err(LookupError::NoData(id.clone())),
            Some(Value::Array(items)) => match items.first() {
                Some(first) => first,
                None => return Err(LookupError::NoData(id.clone())),
            },
            Some(other) => other,
        };

        let element = element
            .as_object()
            .ok_or_else(|| LookupError::InvalidStructure(id.clone()))?;
        let carrier = match element.get("carrier") {
            Some(Value::Object(nested)) => nested,
            _ => element,
        };
        if carrier.is_empty() {
            return Err(LookupError::InvalidStructure(id.clone()));
        }

        let dot_number = text(carrier, "dotNumber").ok_or_else(|| LookupError::MissingUsdot(id.clone()))?;
        let mc_number = text(element, "docketNumber").or_else(|| text(carrier, "mcNumber"));

        let mut profile = build_profile(carrier, &dot_number, mc_number);
        let authority = self.authority_status(&dot_number, web_key).await;
        profile.set(labels::AUTHORITY_STATUS, authority, Absent::NotApplicable);

        Ok(PrimaryRecord { profile, dot_number })
    }

    /// `content[0].authority[0].authStatus`, or None on any failure.
    pub async fn authority_status(&self, dot_number: &str, web_key: &str) -> Option<String> {
        let url = format!(
            "{}/carriers/{}/authority?webKey={}",
            self.base_url,
            urlencoding::encode(dot_number),
            urlencoding::encode(web_key)
        );
        match self.fetch(&url).await {
            Ok(body) => body
                .pointer("/content/0/authority/0/authStatus")
                .and_then(scalar_text),
            Err(e) => {
                warn!(dot_number = dot_number, error = %e, "QCMobile: authority lookup failed, leaving N/A");
                None
            }
        }
    }
}

fn build_profile(carrier: &Map<String, Value>, dot_number: &str, mc_number: Option<String>) -> CarrierProfile {
    let mut profile = CarrierProfile::new();

    profile.set(labels::LEGAL_NAME, text(carrier, "legalName"), Absent::NotApplicable);
    profile.set("DBA Name", text(carrier, "dbaName"), Absent::None);
    profile.set("Physical Address", physical_address(carrier), Absent::NotApplicable);
    profile.set(
        labels::PHONE,
        text(carrier, "telephone").map(|p| format_phone_number(&p)),
        Absent::NotApplicable,
    );
    profile.set(labels::USDOT_NUMBER, Some(dot_number.to_string()), Absent::NotApplicable);
    profile.set(labels::MC_NUMBER, mc_number, Absent::NotApplicable);
    profile.set(
        "Allow to Operate",
        text(carrier, "allowedToOperate").map(|flag| match flag.as_str() {
            "Y" => "Yes".to_string(),
            "N" => "No".to_string(),
            _ => flag,
        }),
        Absent::NotApplicable,
    );
    profile.set(labels::EMAIL, None, Absent::NotAvailable);
    profile.set("Tax EIN", text(carrier, "ein").map(|e| format_tax_ein(&e)), Absent::NotApplicable);

    for &(label, key, absent) in CARRIER_FIELDS {
        profile.set(label, text(carrier, key), absent);
    }

    profile.set(labels::AUTHORITY_STATUS, None, Absent::NotApplicable);
    profile.set(labels::COMPANY_OFFICER, None, Absent::NotApplicable);
    profile
}

fn physical_address(carrier: &Map<String, Value>) -> Option<String> {
    let part = |key: &str| text(carrier, key).unwrap_or_default();
    let (street, city, state, zip) = (part("phyStreet"), part("phyCity"), part("phyState"), part("phyZipcode"));
    if [&street, &city, &state, &zip].iter().all(|p| p.is_empty()) {
        return None;
    }
    Some(format!("{} {}, {} {}", street, city, state, zip).trim().to_string())
}

/// A field as display text. Numbers and booleans are stringified; null,
/// empty strings and nested values count as absent.
pub(crate) fn text(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(scalar_text)
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
