// =============================================================================
// store/mod.rs — SAVED CARRIERS AND THEIR INSURANCE PAPER TRAIL
// =============================================================================
//
// One SQLite file. Many brokerages can save the same real-world carrier, so
// an MC number maps to several rows; an insurance scrape is written to all
// of them at once ("fan-out").
//
// Every fan-out carries the attempt timestamp of the scrape that produced
// it. A row only accepts a write whose timestamp is strictly newer than the
// one it already holds, so a slow scrape from an old request can't clobber
// a fresh one. Documents are keyed by (row, attempt) so replaying the same
// attempt adds nothing.
// =============================================================================

pub mod migrations;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::models::{InsuranceLineItem, NO_INSURANCE_ON_FILE};

/// Date layouts the portal has been seen to use.
const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%d-%m-%Y"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// The insurance fields a saved carrier keeps for its current coverage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsuranceSnapshot {
    pub insurance_type: Option<String>,
    pub insurance_carrier: Option<String>,
    pub policy_number: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub coverage_from: Option<String>,
    pub coverage_to: Option<String>,
    pub effective_date: Option<NaiveDate>,
    pub cancellation_date: Option<NaiveDate>,
}

impl InsuranceSnapshot {
    /// The non-empty, non-sentinel fields of a scraped line item.
    pub fn from_line_item(item: &InsuranceLineItem) -> Self {
        let keep = |v: &str| {
            let v = v.trim();
            (!v.is_empty() && v != NO_INSURANCE_ON_FILE).then(|| v.to_string())
        };
        Self {
            insurance_type: keep(&item.kind),
            insurance_carrier: keep(&item.insurance_carrier),
            policy_number: keep(&item.policy_surety_number),
            posted_date: parse_date(&item.posted_date),
            coverage_from: keep(&item.coverage_from),
            coverage_to: keep(&item.coverage_to),
            effective_date: parse_date(&item.effective_date),
            cancellation_date: parse_date(&item.cancellation_date),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Render back as a line item, dates as `%m/%d/%Y`.
    pub fn to_line_item(&self) -> InsuranceLineItem {
        let date = |d: &Option<NaiveDate>| d.map(|d| d.format("%m/%d/%Y").to_string()).unwrap_or_default();
        InsuranceLineItem {
            kind: self.insurance_type.clone().unwrap_or_default(),
            insurance_carrier: self.insurance_carrier.clone().unwrap_or_default(),
            policy_surety_number: self.policy_number.clone().unwrap_or_default(),
            posted_date: date(&self.posted_date),
            coverage_from: self.coverage_from.clone().unwrap_or_default(),
            coverage_to: self.coverage_to.clone().unwrap_or_default(),
            effective_date: date(&self.effective_date),
            cancellation_date: date(&self.cancellation_date),
        }
    }
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() || raw == NO_INSURANCE_ON_FILE {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCarrier {
    pub id: i64,
    pub company_id: Option<i64>,
    pub mc_number: String,
    pub dot_number: Option<String>,
    pub legal_name: Option<String>,
    pub insurance: InsuranceSnapshot,
    /// Microseconds since the epoch of the scrape attempt last written.
    pub insurance_attempt_at: Option<i64>,
}

/// Just enough to seed a saved carrier; full carrier CRUD lives elsewhere.
#[derive(Debug, Clone, Default)]
pub struct NewCarrier<'a> {
    pub company_id: Option<i64>,
    pub mc_number: &'a str,
    pub dot_number: Option<&'a str>,
    pub legal_name: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarrierDocument {
    pub id: i64,
    pub carrier_id: i64,
    pub attempt_at: i64,
    pub file_name: String,
    pub body: Value,
    pub uploaded_at: String,
}

/// What one fan-out write did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct FanoutReport {
    /// Rows sharing the MC number.
    pub matched: usize,
    /// Rows that took the write.
    pub updated: usize,
    /// Rows holding a newer (or the same) attempt, left alone.
    pub stale: usize,
    pub documents_added: usize,
}

pub struct Store {
    conn: Mutex<Connection>,
}

const CARRIER_COLUMNS: &str = "id, company_id, mc_number, dot_number, legal_name, insurance_type, \
    insurance_carrier, policy_number, posted_date, coverage_from, coverage_to, effective_date, \
    cancellation_date, insurance_attempt_at";

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        info!(path = %path.display(), "Carrier store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Runs `f` while holding the connection, to simulate a long write.
    #[cfg(test)]
    pub(crate) fn while_locked(&self, f: impl FnOnce()) {
        let _conn = self.conn.lock();
        f();
    }

    pub fn insert_carrier(&self, carrier: &NewCarrier<'_>) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO saved_carriers (company_id, mc_number, dot_number, legal_name)
             VALUES (?1, ?2, ?3, ?4)",
            params![carrier.company_id, carrier.mc_number, carrier.dot_number, carrier.legal_name],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn carrier(&self, id: i64) -> Result<Option<SavedCarrier>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM saved_carriers WHERE id = ?1", CARRIER_COLUMNS);
        Ok(conn.query_row(&sql, [id], carrier_from_row).optional()?)
    }

    /// Every row with this MC number, oldest first.
    pub fn carriers_by_mc(&self, mc_number: &str) -> Result<Vec<SavedCarrier>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM saved_carriers WHERE mc_number = ?1 ORDER BY id",
            CARRIER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([mc_number], carrier_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// First row with this MC number, inside `company_id` when given.
    pub fn first_carrier(&self, mc_number: &str, company_id: Option<i64>) -> Result<Option<SavedCarrier>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM saved_carriers
             WHERE mc_number = ?1 AND (?2 IS NULL OR company_id = ?2)
             ORDER BY id LIMIT 1",
            CARRIER_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![mc_number, company_id], carrier_from_row)
            .optional()?)
    }

    /// First row with this MC number saved by some other company.
    pub fn first_carrier_elsewhere(&self, mc_number: &str, company_id: i64) -> Result<Option<SavedCarrier>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM saved_carriers
             WHERE mc_number = ?1 AND (company_id IS NULL OR company_id != ?2)
             ORDER BY id LIMIT 1",
            CARRIER_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![mc_number, company_id], carrier_from_row)
            .optional()?)
    }

    /// Write a scrape result to every row sharing `mc_number`, in one
    /// transaction. Rows already holding this attempt or a newer one are
    /// left alone; every row gets the result in its document history.
    pub fn apply_insurance_snapshot(
        &self,
        mc_number: &str,
        items: &[InsuranceLineItem],
        attempt_at: DateTime<Utc>,
    ) -> Result<FanoutReport, StoreError> {
        let first = match items.first() {
            Some(first) => first,
            None => return Ok(FanoutReport::default()),
        };
        let attempt = attempt_at.timestamp_micros();
        let snapshot = InsuranceSnapshot::from_line_item(first);
        let body = serde_json::to_string(&json!({
            "insurance": items,
            "insurance_carrier": first.insurance_carrier,
        }))?;
        let file_name = format!("insurance_{}_{}.json", mc_number, attempt_at.format("%Y%m%d_%H%M%S"));
        let date = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM saved_carriers WHERE mc_number = ?1 ORDER BY id")?;
            let rows = stmt.query_map([mc_number], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut report = FanoutReport {
            matched: ids.len(),
            ..FanoutReport::default()
        };

        for id in &ids {
            report.documents_added += tx.execute(
                "INSERT OR IGNORE INTO carrier_documents (carrier_id, attempt_at, file_name, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, attempt, file_name, body],
            )?;
        }

        report.updated = tx.execute(
            "UPDATE saved_carriers SET
                insurance_type = COALESCE(?2, insurance_type),
                insurance_carrier = COALESCE(?3, insurance_carrier),
                policy_number = COALESCE(?4, policy_number),
                posted_date = COALESCE(?5, posted_date),
                coverage_from = COALESCE(?6, coverage_from),
                coverage_to = COALESCE(?7, coverage_to),
                effective_date = COALESCE(?8, effective_date),
                cancellation_date = COALESCE(?9, cancellation_date),
                insurance_attempt_at = ?10
             WHERE mc_number = ?1
               AND (insurance_attempt_at IS NULL OR insurance_attempt_at < ?10)",
            params![
                mc_number,
                snapshot.insurance_type,
                snapshot.insurance_carrier,
                snapshot.policy_number,
                date(snapshot.posted_date),
                snapshot.coverage_from,
                snapshot.coverage_to,
                date(snapshot.effective_date),
                date(snapshot.cancellation_date),
                attempt,
            ],
        )?;
        report.stale = report.matched - report.updated;

        tx.commit()?;

        debug!(
            mc_number = mc_number,
            matched = report.matched,
            updated = report.updated,
            stale = report.stale,
            documents = report.documents_added,
            "Insurance fan-out committed"
        );
        Ok(report)
    }

    /// A carrier's document history, newest attempt first.
    pub fn documents_for(&self, carrier_id: i64) -> Result<Vec<CarrierDocument>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, carrier_id, attempt_at, file_name, body, uploaded_at
             FROM carrier_documents WHERE carrier_id = ?1 ORDER BY attempt_at DESC",
        )?;
        let rows = stmt.query_map([carrier_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (id, carrier_id, attempt_at, file_name, body, uploaded_at) = row?;
            documents.push(CarrierDocument {
                id,
                carrier_id,
                attempt_at,
                file_name,
                body: serde_json::from_str(&body)?,
                uploaded_at,
            });
        }
        Ok(documents)
    }

    pub fn latest_document(&self, carrier_id: i64) -> Result<Option<CarrierDocument>, StoreError> {
        Ok(self.documents_for(carrier_id)?.into_iter().next())
    }
}

fn carrier_from_row(row: &Row<'_>) -> rusqlite::Result<SavedCarrier> {
    let date = |idx: usize| -> rusqlite::Result<Option<NaiveDate>> {
        Ok(row
            .get::<_, Option<String>>(idx)?
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()))
    };
    Ok(SavedCarrier {
        id: row.get(0)?,
        company_id: row.get(1)?,
        mc_number: row.get(2)?,
        dot_number: row.get(3)?,
        legal_name: row.get(4)?,
        insurance: InsuranceSnapshot {
            insurance_type: row.get(5)?,
            insurance_carrier: row.get(6)?,
            policy_number: row.get(7)?,
            posted_date: date(8)?,
            coverage_from: row.get(9)?,
            coverage_to: row.get(10)?,
            effective_date: date(11)?,
            cancellation_date: date(12)?,
        },
        insurance_attempt_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn store_with(mcs: &[(Option<i64>, &str)]) -> Store {
        let store = Store::open_in_memory().unwrap();
        for (company_id, mc) in mcs {
            store
                .insert_carrier(&NewCarrier {
                    company_id: *company_id,
                    mc_number: mc,
                    dot_number: Some("1234567"),
                    legal_name: Some("ACME FREIGHT LLC"),
                })
                .unwrap();
        }
        store
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cargo(carrier: &str) -> InsuranceLineItem {
        InsuranceLineItem {
            kind: "Cargo".into(),
            insurance_carrier: carrier.into(),
            policy_surety_number: "POL-9".into(),
            posted_date: "01/15/2024".into(),
            coverage_from: "$0".into(),
            coverage_to: "$100,000".into(),
            effective_date: "2024-01-20".into(),
            cancellation_date: "not a date".into(),
        }
    }

    #[test]
    fn test_migrations_are_recorded() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        migrations::run_migrations(&conn).unwrap();
    }

    #[test]
    fn test_fanout_updates_every_row_with_the_mc() {
        let store = store_with(&[(Some(1), "123"), (Some(2), "123"), (Some(1), "999")]);
        let report = store.apply_insurance_snapshot("123", &[cargo("GREAT WEST")], at(0)).unwrap();
        assert_eq!(
            report,
            FanoutReport { matched: 2, updated: 2, stale: 0, documents_added: 2 }
        );

        for carrier in store.carriers_by_mc("123").unwrap() {
            assert_eq!(carrier.insurance.insurance_type.as_deref(), Some("Cargo"));
            assert_eq!(carrier.insurance.posted_date, NaiveDate::from_ymd_opt(2024, 1, 15));
            assert_eq!(carrier.insurance.effective_date, NaiveDate::from_ymd_opt(2024, 1, 20));
            assert_eq!(carrier.insurance.cancellation_date, None);
            assert_eq!(carrier.insurance_attempt_at, Some(at(0).timestamp_micros()));
        }
        let untouched = store.carriers_by_mc("999").unwrap();
        assert_eq!(untouched[0].insurance, InsuranceSnapshot::default());
    }

    #[test]
    fn test_older_attempt_cannot_overwrite_newer() {
        let store = store_with(&[(None, "123")]);
        store.apply_insurance_snapshot("123", &[cargo("NEWER INS")], at(10)).unwrap();

        let report = store.apply_insurance_snapshot("123", &[cargo("OLDER INS")], at(5)).unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.stale, 1);
        assert_eq!(report.documents_added, 1);

        let carrier = &store.carriers_by_mc("123").unwrap()[0];
        assert_eq!(carrier.insurance.insurance_carrier.as_deref(), Some("NEWER INS"));
        assert_eq!(carrier.insurance_attempt_at, Some(at(10).timestamp_micros()));
    }

    #[test]
    fn test_replaying_an_attempt_is_idempotent() {
        let store = store_with(&[(None, "123")]);
        store.apply_insurance_snapshot("123", &[cargo("A")], at(1)).unwrap();
        let report = store.apply_insurance_snapshot("123", &[cargo("A")], at(1)).unwrap();
        assert_eq!(report, FanoutReport { matched: 1, updated: 0, stale: 1, documents_added: 0 });

        let carrier_id = store.carriers_by_mc("123").unwrap()[0].id;
        assert_eq!(store.documents_for(carrier_id).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_fields_keep_existing_values() {
        let store = store_with(&[(None, "123")]);
        store.apply_insurance_snapshot("123", &[cargo("A")], at(1)).unwrap();

        let sparse = InsuranceLineItem {
            kind: "BIPD/Primary".into(),
            ..InsuranceLineItem::default()
        };
        store.apply_insurance_snapshot("123", &[sparse], at(2)).unwrap();

        let carrier = &store.carriers_by_mc("123").unwrap()[0];
        assert_eq!(carrier.insurance.insurance_type.as_deref(), Some("BIPD/Primary"));
        assert_eq!(carrier.insurance.insurance_carrier.as_deref(), Some("A"));
        assert_eq!(carrier.insurance.coverage_to.as_deref(), Some("$100,000"));
    }

    #[test]
    fn test_sentinel_changes_nothing_but_is_recorded() {
        let store = store_with(&[(None, "123")]);
        let report = store
            .apply_insurance_snapshot("123", &[InsuranceLineItem::no_insurance_on_file()], at(3))
            .unwrap();
        assert_eq!(report.updated, 1);

        let carrier = &store.carriers_by_mc("123").unwrap()[0];
        assert!(carrier.insurance.is_empty());

        let docs = store.documents_for(carrier.id).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].body["insurance"][0]["type"], "No Insurance on file");
        assert_eq!(docs[0].file_name, format!("insurance_123_{}.json", at(3).format("%Y%m%d_%H%M%S")));
    }

    #[test]
    fn test_history_is_newest_first() {
        let store = store_with(&[(None, "123")]);
        store.apply_insurance_snapshot("123", &[cargo("FIRST")], at(1)).unwrap();
        store.apply_insurance_snapshot("123", &[cargo("SECOND")], at(2)).unwrap();

        let carrier_id = store.carriers_by_mc("123").unwrap()[0].id;
        let latest = store.latest_document(carrier_id).unwrap().unwrap();
        assert_eq!(latest.body["insurance_carrier"], "SECOND");
    }

    #[test]
    fn test_company_scoped_lookups() {
        let store = store_with(&[(Some(1), "123"), (Some(2), "123")]);
        assert_eq!(store.first_carrier("123", Some(2)).unwrap().unwrap().company_id, Some(2));
        assert_eq!(store.first_carrier("123", None).unwrap().unwrap().company_id, Some(1));
        assert!(store.first_carrier("123", Some(3)).unwrap().is_none());
        assert_eq!(store.first_carrier_elsewhere("123", 1).unwrap().unwrap().company_id, Some(2));
        assert!(store.first_carrier("nope", None).unwrap().is_none());
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(parse_date("03/04/2024"), NaiveDate::from_ymd_opt(2024, 3, 4));
        assert_eq!(parse_date("2024-03-04"), NaiveDate::from_ymd_opt(2024, 3, 4));
        assert_eq!(parse_date("04-03-2024"), NaiveDate::from_ymd_opt(2024, 3, 4));
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date(NO_INSURANCE_ON_FILE), None);
    }
}
