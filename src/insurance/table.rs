// =============================================================================
// insurance/table.rs — READING THE ACTIVE/PENDING INSURANCE PAGE
// =============================================================================
//
// The L&I portal renders insurance filings as an HTML table laid out inside
// other HTML tables, with header cells like "Posted  Date" (two spaces,
// every time). We find the table that owns an "Insurance Carrier" header,
// map each data row to its header names, and keep only the coverage types
// a brokerage actually checks before tendering a load.
// =============================================================================

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::models::{InsuranceLineItem, ScrapeOutcome};

// Selector strings are constants; parse only fails on malformed CSS.
static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static TR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static TH: Lazy<Selector> = Lazy::new(|| Selector::parse("th").unwrap());
static STRONG: Lazy<Selector> = Lazy::new(|| Selector::parse("strong").unwrap());

/// Coverage types worth reporting. Matching ignores case, spaces and slashes.
pub const COVERAGE_WHITELIST: &[&str] = &[
    "BIPD/Primary",
    "BIPD/Excess",
    "Cargo",
    "General Liability",
    "Auto Liability",
    "Workers Comp",
    "Surety Bond",
    "Trust Fund",
    "Excess BIPD",
    "Primary BIPD",
    "SURETY",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("No tables found on insurance page")]
    NoTables,
    #[error("No table with 'Insurance Carrier' header found")]
    NoInsuranceHeader,
    #[error("No rows found in insurance table")]
    NoRows,
}

/// Parse the rendered results page into line items, or the no-insurance
/// sentinel when the portal has nothing (or nothing whitelisted) on file.
pub fn parse_insurance_page(html: &str) -> Result<ScrapeOutcome, TableError> {
    let document = Html::parse_document(html);

    if document
        .select(&STRONG)
        .any(|s| collapse(&s.text().collect::<String>()).contains("No Data Available"))
    {
        return Ok(ScrapeOutcome::NoInsuranceOnFile);
    }

    let tables: Vec<ElementRef> = document.select(&TABLE).collect();
    if tables.is_empty() {
        return Err(TableError::NoTables);
    }

    let table = tables
        .iter()
        .copied()
        .find(|table| {
            table
                .select(&TH)
                .filter(|th| owned_by(*table, *th))
                .any(|th| header_text(th) == "insurance carrier")
        })
        .ok_or(TableError::NoInsuranceHeader)?;

    let rows: Vec<ElementRef> = table.select(&TR).filter(|tr| owned_by(table, *tr)).collect();
    let (header_row, data_rows) = rows.split_first().ok_or(TableError::NoRows)?;

    let headers: Vec<String> = cells(*header_row)
        .filter(|c| c.value().name() == "th")
        .map(header_text)
        .collect();
    debug!(headers = ?headers, "Insurance table headers");

    let mut items = Vec::new();
    for row in data_rows {
        let values: Vec<String> = cells(*row).map(|c| collapse(&c.text().collect::<String>())).collect();
        if values.len() < headers.len() {
            continue;
        }
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .map(|i| values[i].clone())
                .unwrap_or_default()
        };

        let kind = column("type");
        if !is_whitelisted(&kind) {
            debug!(coverage_type = %kind, "Dropping coverage type not on the whitelist");
            continue;
        }

        items.push(InsuranceLineItem {
            kind,
            insurance_carrier: column("insurance carrier"),
            policy_surety_number: column("policy/surety"),
            posted_date: column("posted date"),
            coverage_from: column("coverage from"),
            coverage_to: column("coverage to"),
            effective_date: column("effective date"),
            cancellation_date: column("cancellation date"),
        });
    }

    if items.is_empty() {
        Ok(ScrapeOutcome::NoInsuranceOnFile)
    } else {
        Ok(ScrapeOutcome::Found(items))
    }
}

pub fn is_whitelisted(kind: &str) -> bool {
    let wanted = squash(kind);
    !wanted.is_empty() && COVERAGE_WHITELIST.iter().any(|w| squash(w) == wanted)
}

fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '/')
        .flat_map(char::to_lowercase)
        .collect()
}

fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn header_text(th: ElementRef) -> String {
    collapse(&th.text().collect::<String>()).to_lowercase()
}

/// Direct `td`/`th` children of a row.
fn cells<'a>(row: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
}

/// True when `table` is the nearest enclosing table of `node`, so rows of
/// layout tables nested inside don't leak in.
fn owned_by(table: ElementRef, node: ElementRef) -> bool {
    node.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "table")
        .map(|t| t.id() == table.id())
        .unwrap_or(false)
}
