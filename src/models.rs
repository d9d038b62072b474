// =============================================================================
// models.rs — THE RECORDS THAT FLOW THROUGH THE PIPELINE
// =============================================================================
//
// Carrier profiles, insurance line items, scrape outcomes and the events we
// broadcast after a write. None of these are cached anywhere: every lookup
// builds them from scratch out of whatever the government felt like
// returning today.
//
// Absence is explicit. A profile field is an Option internally; the
// "N/A" / "None" / "Not Available" strings callers expect only appear when
// the profile is flattened at the edge (CarrierProfile::to_record).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::normalize::normalize_key;

/// Profile labels that more than one component reads or writes.
pub mod labels {
    pub const USDOT_NUMBER: &str = "USDOT Number";
    pub const MC_NUMBER: &str = "MC Number";
    pub const PHONE: &str = "Phone";
    pub const EMAIL: &str = "Email";
    pub const COMPANY_OFFICER: &str = "Company Officer";
    pub const AUTHORITY_STATUS: &str = "Authority Status";
    pub const LEGAL_NAME: &str = "Legal Name";
}

/// What an absent profile field renders as once flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absent {
    /// "N/A" — the source had nothing for a field it normally carries.
    NotApplicable,
    /// "None" — optional narrative fields (DBA, review dates, ratings).
    None,
    /// "Not Available" — contact fields the dataset didn't publish.
    NotAvailable,
}

impl Absent {
    pub fn as_str(self) -> &'static str {
        match self {
            Absent::NotApplicable => "N/A",
            Absent::None => "None",
            Absent::NotAvailable => "Not Available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileField {
    pub label: &'static str,
    pub value: Option<String>,
    pub absent: Absent,
}

/// A carrier's registration and safety snapshot, assembled from QCMobile
/// and the DOT census dataset. Field order follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarrierProfile {
    fields: Vec<ProfileField>,
}

impl CarrierProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, or replace the value of an existing one. Empty and
    /// whitespace-only values are stored as absent.
    pub fn set(&mut self, label: &'static str, value: Option<String>, absent: Absent) {
        let value = value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        match self.fields.iter_mut().find(|f| f.label == label) {
            Some(field) => {
                field.value = value;
                field.absent = absent;
            }
            None => self.fields.push(ProfileField { label, value, absent }),
        }
    }

    /// Replace a field's value only if `value` is present.
    pub fn set_if_present(&mut self, label: &'static str, value: Option<String>, absent: Absent) {
        if value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false) {
            self.set(label, value, absent);
        }
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label == label)
            .and_then(|f| f.value.as_deref())
    }

    pub fn fields(&self) -> &[ProfileField] {
        &self.fields
    }

    /// Flatten into the token-keyed, always-present map handed to callers.
    pub fn to_record(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|f| {
                let value = f
                    .value
                    .clone()
                    .unwrap_or_else(|| f.absent.as_str().to_string());
                (normalize_key(f.label), value)
            })
            .collect()
    }
}

/// Type label the scraper uses when the portal confirms there is no
/// insurance filed. Distinct from a scrape that failed.
pub const NO_INSURANCE_ON_FILE: &str = "No Insurance on file";

/// One row of the portal's active/pending insurance table. Dates are kept
/// exactly as scraped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceLineItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub insurance_carrier: String,
    #[serde(default)]
    pub policy_surety_number: String,
    #[serde(default)]
    pub posted_date: String,
    #[serde(default)]
    pub coverage_from: String,
    #[serde(default)]
    pub coverage_to: String,
    #[serde(default)]
    pub effective_date: String,
    #[serde(default)]
    pub cancellation_date: String,
}

impl InsuranceLineItem {
    pub fn no_insurance_on_file() -> Self {
        Self {
            kind: NO_INSURANCE_ON_FILE.to_string(),
            policy_surety_number: NO_INSURANCE_ON_FILE.to_string(),
            ..Self::default()
        }
    }

    /// Placeholder row returned while the background scrape is still going.
    pub fn processing() -> Self {
        Self {
            kind: "Processing".to_string(),
            policy_surety_number: "Insurance data is being retrieved in the background.".to_string(),
            ..Self::default()
        }
    }

    pub fn is_no_insurance_sentinel(&self) -> bool {
        self.kind == NO_INSURANCE_ON_FILE
    }
}

/// What a single scrape attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// At least one whitelisted coverage row.
    Found(Vec<InsuranceLineItem>),
    /// The portal says there is nothing on file, or nothing survived the
    /// coverage-type whitelist.
    NoInsuranceOnFile,
    /// Some step blew up. The message is what ends up in `{"error": ...}`.
    Failed(String),
}

impl ScrapeOutcome {
    /// True when the result is worth persisting.
    pub fn is_usable(&self) -> bool {
        !matches!(self, ScrapeOutcome::Failed(_))
    }

    pub fn line_items(&self) -> Vec<InsuranceLineItem> {
        match self {
            ScrapeOutcome::Found(items) => items.clone(),
            ScrapeOutcome::NoInsuranceOnFile => vec![InsuranceLineItem::no_insurance_on_file()],
            ScrapeOutcome::Failed(_) => Vec::new(),
        }
    }

    /// The wire shape: a list of line items, or `[{"error": "..."}]`.
    pub fn to_json(&self) -> Value {
        match self {
            ScrapeOutcome::Failed(message) => json!([{ "error": message }]),
            other => json!(other.line_items()),
        }
    }

    /// Read back what a scraper process printed.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => match map.get("error") {
                Some(err) => ScrapeOutcome::Failed(value_text(err)),
                None => ScrapeOutcome::Failed("unexpected scraper output".to_string()),
            },
            Value::Array(entries) => {
                if let Some(err) = entries.first().and_then(|e| e.get("error")) {
                    return ScrapeOutcome::Failed(value_text(err));
                }
                let items: Vec<InsuranceLineItem> =
                    match serde_json::from_value(Value::Array(entries.clone())) {
                        Ok(items) => items,
                        Err(e) => return ScrapeOutcome::Failed(format!("invalid scraper output: {}", e)),
                    };
                match items.as_slice() {
                    [] => ScrapeOutcome::Failed("scraper returned no line items".to_string()),
                    [only] if only.is_no_insurance_sentinel() => ScrapeOutcome::NoInsuranceOnFile,
                    _ => ScrapeOutcome::Found(items),
                }
            }
            _ => ScrapeOutcome::Failed("unexpected scraper output".to_string()),
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Which of the two scrape attempts for a request produced a write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScrapeOrigin {
    /// The bounded attempt that runs inside the request.
    Foreground,
    /// The queued attempt a worker picked up.
    Background,
}

impl fmt::Display for ScrapeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScrapeOrigin::Foreground => write!(f, "FOREGROUND"),
            ScrapeOrigin::Background => write!(f, "BACKGROUND"),
        }
    }
}

/// Published to Redis after every fan-out write so the brokerage app can
/// refresh instead of polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceEvent {
    pub id: String,
    pub mc_number: String,
    pub origin: ScrapeOrigin,
    /// The attempt timestamp the write was tagged with.
    pub attempt_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub carriers_updated: usize,
    pub stale_rejected: usize,
    pub insurance_type: Option<String>,
    pub insurance_carrier: Option<String>,
}

impl InsuranceEvent {
    pub fn new(mc_number: String, origin: ScrapeOrigin, attempt_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mc_number,
            origin,
            attempt_at,
            detected_at: Utc::now(),
            carriers_updated: 0,
            stale_rejected: 0,
            insurance_type: None,
            insurance_carrier: None,
        }
    }
}

impl fmt::Display for InsuranceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] MC# {} via {}: {} updated, {} stale",
            self.id, self.mc_number, self.origin, self.carriers_updated, self.stale_rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_flattens_absent_fields_to_their_sentinels() {
        let mut profile = CarrierProfile::new();
        profile.set("Legal Name", Some("ACME FREIGHT LLC".into()), Absent::NotApplicable);
        profile.set("DBA Name", None, Absent::None);
        profile.set("Email", Some("   ".into()), Absent::NotAvailable);
        profile.set("Out of Service Date", None, Absent::None);

        let record = profile.to_record();
        assert_eq!(record["Legal_Name"], "ACME FREIGHT LLC");
        assert_eq!(record["DBA_Name"], "None");
        assert_eq!(record["Email"], "Not Available");
        assert_eq!(record["Out_of_Service_Date"], "None");
    }

    #[test]
    fn test_set_if_present_keeps_existing_value() {
        let mut profile = CarrierProfile::new();
        profile.set(labels::PHONE, Some("555-123-4567".into()), Absent::NotApplicable);
        profile.set_if_present(labels::PHONE, None, Absent::NotApplicable);
        assert_eq!(profile.get(labels::PHONE), Some("555-123-4567"));
        profile.set_if_present(labels::PHONE, Some("555-000-0000".into()), Absent::NotApplicable);
        assert_eq!(profile.get(labels::PHONE), Some("555-000-0000"));
        assert_eq!(profile.fields().len(), 1);
    }

    #[test]
    fn test_outcome_from_error_list() {
        let value = json!([{ "error": "Unexpected error: boom" }]);
        assert_eq!(
            ScrapeOutcome::from_json(&value),
            ScrapeOutcome::Failed("Unexpected error: boom".into())
        );
    }

    #[test]
    fn test_outcome_from_sentinel_list() {
        let value = ScrapeOutcome::NoInsuranceOnFile.to_json();
        assert_eq!(ScrapeOutcome::from_json(&value), ScrapeOutcome::NoInsuranceOnFile);
        assert!(ScrapeOutcome::NoInsuranceOnFile.is_usable());
    }

    #[test]
    fn test_outcome_from_line_items() {
        let value = json!([{
            "type": "BIPD/Primary",
            "insurance_carrier": "PROGRESSIVE",
            "policy_surety_number": "CA123",
            "posted_date": "01/02/2024",
            "coverage_from": "0",
            "coverage_to": "750,000",
            "effective_date": "01/01/2024",
            "cancellation_date": ""
        }]);
        match ScrapeOutcome::from_json(&value) {
            ScrapeOutcome::Found(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].kind, "BIPD/Primary");
                assert_eq!(items[0].coverage_to, "750,000");
            }
            other => panic!("expected line items, got {:?}", other),
        }
    }

    #[test]
    fn test_outcome_rejects_garbage() {
        assert!(!ScrapeOutcome::from_json(&json!("hello")).is_usable());
        assert!(!ScrapeOutcome::from_json(&json!([])).is_usable());
        assert!(!ScrapeOutcome::from_json(&json!([{ "nope": 1 }])).is_usable());
    }

    #[test]
    fn test_event_display_is_plain_ascii() {
        let mut event = InsuranceEvent::new("123456".into(), ScrapeOrigin::Background, Utc::now());
        event.carriers_updated = 2;
        event.stale_rejected = 1;
        let line = event.to_string();
        assert!(line.is_ascii(), "{}", line);
        assert!(line.ends_with("MC# 123456 via BACKGROUND: 2 updated, 1 stale"));
    }
}
