// =============================================================================
// runner/mod.rs — TWO SCRAPES ENTER, THE NEWEST ONE WINS
// =============================================================================
//
// An insurance fetch does two things with the same MC number:
//
//   1. Queues a durable background job (generous deadline, survives a
//      crash, picked up by a worker).
//   2. Runs a short foreground scrape inside the request and hands the
//      caller whatever it got, or a "processing" placeholder.
//
// Both attempts carry the same attempt timestamp, taken from a clock that
// never repeats or goes backwards. The store only accepts a write that is
// newer than what a row already holds, so the foreground/background pair,
// redelivered jobs, and slow scrapes from earlier requests can land in any
// order without an older result clobbering a newer one.
// =============================================================================

pub mod queue;
pub mod subprocess;
pub mod worker;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::models::{InsuranceEvent, InsuranceLineItem, ScrapeOrigin, ScrapeOutcome};
use crate::store::{FanoutReport, InsuranceSnapshot, Store, StoreError};

use queue::{JobQueue, QueueError, ScrapeJob};
use subprocess::{run_scraper, RunOutcome, ScraperCommand};

const FETCH_PROCESSING: &str =
    "The insurance information is being processed in the background. Please check back later or refresh the page.";
const STATUS_PROCESSING: &str = "Insurance data is still being processed";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("MC number is required")]
    MissingMc,

    #[error("No carriers found with MC# {0}")]
    UnknownCarrier(String),

    #[error("Carrier with MC# {0} not found")]
    CarrierNotFound(String),

    #[error("failed to start scraper: {0}")]
    Spawn(std::io::Error),

    #[error("scraper i/o: {0}")]
    Io(std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),
}

/// What the fetch and status endpoints answer with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InsuranceResponse {
    Success {
        message: String,
        insurance: Vec<InsuranceLineItem>,
        insurance_carrier: String,
        carrier_id: i64,
        company_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        carrier_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<i64>,
    },
    Processing {
        message: String,
        insurance: Vec<InsuranceLineItem>,
        insurance_carrier: String,
    },
    /// Someone else's company saved this carrier; yours hasn't.
    NotInCompany {
        message: String,
        mc_number: String,
        dot_number: Option<String>,
        legal_name: Option<String>,
        from_company_id: Option<i64>,
    },
}

impl InsuranceResponse {
    pub fn processing(message: &str) -> Self {
        InsuranceResponse::Processing {
            message: message.to_string(),
            insurance: vec![InsuranceLineItem::processing()],
            insurance_carrier: "Processing".to_string(),
        }
    }
}

/// Microsecond attempt timestamps, strictly increasing within the process.
#[derive(Debug, Default)]
pub struct AttemptClock {
    last: AtomicI64,
}

impl AttemptClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return DateTime::from_timestamp_micros(candidate).unwrap_or_else(Utc::now),
                Err(actual) => prev = actual,
            }
        }
    }
}

pub struct ScraperRunner {
    store: Arc<Store>,
    queue: Arc<dyn JobQueue>,
    command: ScraperCommand,
    clock: AttemptClock,
    metrics: Arc<MetricsCollector>,
    events: Option<Sender<InsuranceEvent>>,
    foreground_timeout: Duration,
    background_timeout: Duration,
    terminate_grace: Duration,
}

impl ScraperRunner {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
        command: ScraperCommand,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            queue,
            command,
            clock: AttemptClock::new(),
            metrics,
            events: None,
            foreground_timeout: config.foreground_timeout,
            background_timeout: config.background_timeout,
            terminate_grace: config.terminate_grace,
        }
    }

    /// Send an `InsuranceEvent` after every fan-out write that changed something.
    pub fn with_events(mut self, events: Sender<InsuranceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// SQLite calls block, so they run on the blocking pool rather than
    /// on a runtime worker.
    async fn on_store<T, F>(&self, f: F) -> Result<T, RunnerError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    /// Queue a background scrape and try a bounded one right now.
    pub async fn fetch(&self, mc_number: &str) -> Result<InsuranceResponse, RunnerError> {
        let mc = mc_number.trim();
        if mc.is_empty() {
            return Err(RunnerError::MissingMc);
        }
        let lookup_mc = mc.to_string();
        let carriers = self.on_store(move |store| store.carriers_by_mc(&lookup_mc)).await?;
        let reference = carriers
            .first()
            .ok_or_else(|| RunnerError::UnknownCarrier(mc.to_string()))?;
        info!(
            mc_number = mc,
            carriers = carriers.len(),
            reference_id = reference.id,
            "Insurance fetch requested"
        );

        let attempt_at = self.clock.next();
        let job = ScrapeJob::new(mc, attempt_at);
        match self.queue.enqueue(&job).await {
            Ok(()) => {
                self.metrics.increment_jobs_enqueued();
                info!(job_id = %job.id, mc_number = mc, "Background scrape queued");
            }
            Err(e) => error!(mc_number = mc, error = %e, "Background scrape could not be queued"),
        }

        self.metrics.increment_foreground_scrapes();
        let outcome = match run_scraper(&self.command, mc, self.foreground_timeout, self.terminate_grace).await {
            Ok(RunOutcome::Completed(outcome)) => outcome,
            Ok(RunOutcome::TimedOut { .. }) => {
                self.metrics.increment_foreground_timeouts();
                return Ok(InsuranceResponse::processing(FETCH_PROCESSING));
            }
            Err(e) => {
                error!(mc_number = mc, error = %e, "Foreground scrape could not run");
                self.metrics.increment_scrape_failures();
                return Ok(InsuranceResponse::processing(FETCH_PROCESSING));
            }
        };

        if let ScrapeOutcome::Failed(reason) = &outcome {
            warn!(mc_number = mc, reason = %reason, "Foreground scrape failed, leaving it to the background job");
            self.metrics.increment_scrape_failures();
            return Ok(InsuranceResponse::processing(FETCH_PROCESSING));
        }

        let items = outcome.line_items();
        self.fan_out(mc, &items, attempt_at, ScrapeOrigin::Foreground).await?;

        Ok(InsuranceResponse::Success {
            message: format!(
                "Insurance data retrieved successfully and will be applied to all {} carriers with this MC number",
                carriers.len()
            ),
            insurance_carrier: items
                .first()
                .map(|i| i.insurance_carrier.clone())
                .unwrap_or_default(),
            insurance: items,
            carrier_id: reference.id,
            company_id: reference.company_id,
            carrier_count: Some(carriers.len()),
            file_id: None,
        })
    }

    /// Run a queued job to completion. Failures are logged and counted;
    /// only store errors come back as `Err`.
    pub async fn process_job(&self, job: &ScrapeJob) -> Result<Option<FanoutReport>, RunnerError> {
        self.metrics.increment_background_scrapes();
        info!(job_id = %job.id, mc_number = %job.mc_number, delivery = job.deliveries, "Background scrape starting");

        let outcome = match run_scraper(&self.command, &job.mc_number, self.background_timeout, self.terminate_grace).await {
            Ok(RunOutcome::Completed(outcome)) => outcome,
            Ok(RunOutcome::TimedOut { killed, .. }) => {
                warn!(job_id = %job.id, mc_number = %job.mc_number, killed = killed, "Background scrape timed out");
                self.metrics.increment_scrape_failures();
                return Ok(None);
            }
            Err(e) => {
                error!(job_id = %job.id, mc_number = %job.mc_number, error = %e, "Background scrape could not run");
                self.metrics.increment_scrape_failures();
                return Ok(None);
            }
        };

        if let ScrapeOutcome::Failed(reason) = &outcome {
            warn!(job_id = %job.id, mc_number = %job.mc_number, reason = %reason, "Background scrape failed");
            self.metrics.increment_scrape_failures();
            return Ok(None);
        }

        let report = self
            .fan_out(&job.mc_number, &outcome.line_items(), job.attempt_at, ScrapeOrigin::Background)
            .await?;
        Ok(Some(report))
    }

    async fn fan_out(
        &self,
        mc_number: &str,
        items: &[InsuranceLineItem],
        attempt_at: DateTime<Utc>,
        origin: ScrapeOrigin,
    ) -> Result<FanoutReport, RunnerError> {
        let (mc, batch) = (mc_number.to_string(), items.to_vec());
        let report = self
            .on_store(move |store| store.apply_insurance_snapshot(&mc, &batch, attempt_at))
            .await?;
        self.metrics.record_fanout(&report);
        info!(
            mc_number = mc_number,
            origin = %origin,
            updated = report.updated,
            stale = report.stale,
            "Insurance fanned out"
        );

        if report.updated == 0 && report.documents_added == 0 {
            return Ok(report);
        }
        if let Some(events) = &self.events {
            let snapshot = items.first().map(InsuranceSnapshot::from_line_item).unwrap_or_default();
            let mut event = InsuranceEvent::new(mc_number.to_string(), origin, attempt_at);
            event.carriers_updated = report.updated;
            event.stale_rejected = report.stale;
            event.insurance_type = snapshot.insurance_type;
            event.insurance_carrier = snapshot.insurance_carrier;
            if let Err(e) = events.try_send(event) {
                warn!(mc_number = mc_number, error = %e, "Insurance event dropped");
            }
        }
        Ok(report)
    }

    /// What do we currently know about this carrier's insurance?
    pub fn status(&self, mc_number: &str, company_id: Option<i64>) -> Result<InsuranceResponse, RunnerError> {
        let mc = mc_number.trim();
        if mc.is_empty() {
            return Err(RunnerError::MissingMc);
        }

        let carrier = match self.store.first_carrier(mc, company_id)? {
            Some(carrier) => carrier,
            None => {
                if let Some(company_id) = company_id {
                    if let Some(other) = self.store.first_carrier_elsewhere(mc, company_id)? {
                        return Ok(InsuranceResponse::NotInCompany {
                            message: "Carrier exists in another company. Creating a copy in your company.".to_string(),
                            mc_number: mc.to_string(),
                            dot_number: other.dot_number,
                            legal_name: other.legal_name,
                            from_company_id: other.company_id,
                        });
                    }
                }
                return Err(RunnerError::CarrierNotFound(mc.to_string()));
            }
        };

        if carrier.insurance.insurance_type.is_some() {
            return Ok(InsuranceResponse::Success {
                message: "Insurance data is available".to_string(),
                insurance: vec![carrier.insurance.to_line_item()],
                insurance_carrier: carrier
                    .insurance
                    .insurance_carrier
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                carrier_id: carrier.id,
                company_id: carrier.company_id,
                carrier_count: None,
                file_id: None,
            });
        }

        if let Some(doc) = self.store.latest_document(carrier.id)? {
            let insurance = doc
                .body
                .get("insurance")
                .cloned()
                .map(serde_json::from_value::<Vec<InsuranceLineItem>>);
            match insurance {
                Some(Ok(insurance)) => {
                    return Ok(InsuranceResponse::Success {
                        message: "Insurance data is available from file".to_string(),
                        insurance,
                        insurance_carrier: doc
                            .body
                            .get("insurance_carrier")
                            .and_then(|v| v.as_str())
                            .unwrap_or("Unknown")
                            .to_string(),
                        carrier_id: carrier.id,
                        company_id: carrier.company_id,
                        carrier_count: None,
                        file_id: Some(doc.id),
                    })
                }
                _ => error!(carrier_id = carrier.id, file = %doc.file_name, "Unreadable insurance document"),
            }
        }

        Ok(InsuranceResponse::processing(STATUS_PROCESSING))
    }
}

#[cfg(test)]
mod tests {
    use super::queue::MemoryQueue;
    use super::subprocess::testing::shell;
    use super::*;
    use crate::store::NewCarrier;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    const CARGO_JSON: &str = r#"echo '[{"type":"Cargo","insurance_carrier":"GREAT WEST CASUALTY","policy_surety_number":"GW-1","posted_date":"01/15/2024","coverage_from":"$0","coverage_to":"$100,000","effective_date":"01/20/2024","cancellation_date":""}]'"#;

    struct Rig {
        runner: ScraperRunner,
        queue: Arc<MemoryQueue>,
        store: Arc<Store>,
        metrics: Arc<MetricsCollector>,
        events: crossbeam_channel::Receiver<InsuranceEvent>,
    }

    fn rig(script: &str, seed: &[(Option<i64>, &str)]) -> Rig {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for (company_id, mc) in seed {
            store
                .insert_carrier(&NewCarrier {
                    company_id: *company_id,
                    mc_number: mc,
                    dot_number: Some("1234567"),
                    legal_name: Some("ACME FREIGHT LLC"),
                })
                .unwrap();
        }
        let queue = Arc::new(MemoryQueue::new());
        let metrics = Arc::new(MetricsCollector::new());
        let (tx, rx) = crossbeam_channel::bounded(16);
        let mut config = Config::for_tests();
        config.foreground_timeout = Duration::from_millis(500);
        let runner = ScraperRunner::new(store.clone(), queue.clone(), shell(script), metrics.clone(), &config)
            .with_events(tx);
        Rig { runner, queue, store, metrics, events: rx }
    }

    #[test]
    fn test_attempt_clock_never_repeats() {
        let clock = AttemptClock::new();
        let stamps: Vec<_> = (0..1000).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_fetch_requires_mc() {
        let rig = rig(CARGO_JSON, &[]);
        assert!(matches!(rig.runner.fetch("  ").await, Err(RunnerError::MissingMc)));
        assert_eq!(rig.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_unknown_carrier() {
        let rig = rig(CARGO_JSON, &[(Some(1), "111")]);
        let err = rig.runner.fetch("999").await.unwrap_err();
        assert_eq!(err.to_string(), "No carriers found with MC# 999");
        assert_eq!(rig.queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_success_fans_out_and_queues_background_job() {
        let rig = rig(CARGO_JSON, &[(Some(1), "123"), (Some(2), "123")]);
        let response = rig.runner.fetch("123").await.unwrap();

        match response {
            InsuranceResponse::Success { insurance, insurance_carrier, carrier_count, company_id, .. } => {
                assert_eq!(insurance[0].kind, "Cargo");
                assert_eq!(insurance_carrier, "GREAT WEST CASUALTY");
                assert_eq!(carrier_count, Some(2));
                assert_eq!(company_id, Some(1));
            }
            other => panic!("expected success, got {:?}", other),
        }

        for carrier in rig.store.carriers_by_mc("123").unwrap() {
            assert_eq!(carrier.insurance.policy_number.as_deref(), Some("GW-1"));
            assert_eq!(carrier.insurance.effective_date, NaiveDate::from_ymd_opt(2024, 1, 20));
        }
        assert_eq!(rig.queue.pending_len(), 1);

        let event = rig.events.try_recv().unwrap();
        assert_eq!(event.carriers_updated, 2);
        assert_eq!(event.origin, ScrapeOrigin::Foreground);
        assert_eq!(event.insurance_type.as_deref(), Some("Cargo"));

        let snap = rig.metrics.snapshot();
        assert_eq!(snap.foreground_scrapes, 1);
        assert_eq!(snap.fanout_writes, 2);
        assert_eq!(snap.jobs_enqueued, 1);
    }

    #[tokio::test]
    async fn test_busy_store_does_not_stall_the_runtime() {
        let rig = rig(CARGO_JSON, &[(None, "123")]);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let store = rig.store.clone();
        let writer = std::thread::spawn(move || {
            store.while_locked(|| {
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(600));
            })
        });
        locked_rx.recv().unwrap();

        // Single-threaded runtime: the ticker only fires on time if the
        // fetch yields while it waits for the store.
        let started = tokio::time::Instant::now();
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            started.elapsed()
        });
        let (fetched, ticked) = tokio::join!(rig.runner.fetch("123"), ticker);

        assert!(matches!(fetched.unwrap(), InsuranceResponse::Success { .. }));
        assert!(ticked.unwrap() < Duration::from_millis(400));
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_foreground_timeout_returns_processing() {
        let rig = rig("exec sleep 30", &[(None, "123")]);
        let response = rig.runner.fetch("123").await.unwrap();

        assert_eq!(response, InsuranceResponse::processing(FETCH_PROCESSING));
        assert_eq!(rig.metrics.snapshot().foreground_timeouts, 1);
        assert_eq!(rig.queue.pending_len(), 1);
        assert!(rig.store.carriers_by_mc("123").unwrap()[0].insurance.is_empty());
    }

    #[tokio::test]
    async fn test_foreground_failure_returns_processing() {
        let rig = rig(r#"echo '[{"error":"No rows found in insurance table"}]'"#, &[(None, "123")]);
        let response = rig.runner.fetch("123").await.unwrap();
        assert_eq!(response, InsuranceResponse::processing(FETCH_PROCESSING));
        assert_eq!(rig.metrics.snapshot().scrape_failures, 1);
    }

    #[tokio::test]
    async fn test_background_job_from_older_request_is_rejected_as_stale() {
        let rig = rig(CARGO_JSON, &[(None, "123")]);
        let older = ScrapeJob::new("123", rig.runner.clock.next());
        rig.runner.fetch("123").await.unwrap();

        let report = rig.runner.process_job(&older).await.unwrap().unwrap();
        assert_eq!(report.updated, 0);
        assert_eq!(report.stale, 1);
        assert_eq!(rig.metrics.snapshot().stale_writes_rejected, 1);
    }

    #[tokio::test]
    async fn test_foreground_and_background_pair_writes_history_once() {
        let rig = rig(CARGO_JSON, &[(None, "123")]);
        rig.runner.fetch("123").await.unwrap();
        let claimed = rig.queue.claim().await.unwrap().unwrap();

        let report = rig.runner.process_job(&claimed.job).await.unwrap().unwrap();
        assert_eq!(report.documents_added, 0);
        assert_eq!(report.updated, 0);

        let carrier_id = rig.store.carriers_by_mc("123").unwrap()[0].id;
        assert_eq!(rig.store.documents_for(carrier_id).unwrap().len(), 1);
        // Only the foreground write produced an event.
        assert!(rig.events.try_recv().is_ok());
        assert!(rig.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_reports_current_snapshot() {
        let rig = rig(CARGO_JSON, &[(Some(1), "123")]);
        rig.runner.fetch("123").await.unwrap();

        match rig.runner.status("123", Some(1)).unwrap() {
            InsuranceResponse::Success { message, insurance, insurance_carrier, .. } => {
                assert_eq!(message, "Insurance data is available");
                assert_eq!(insurance[0].posted_date, "01/15/2024");
                assert_eq!(insurance_carrier, "GREAT WEST CASUALTY");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_falls_back_to_latest_document() {
        let rig = rig(
            r#"echo '[{"type":"No Insurance on file","policy_surety_number":"No Insurance on file"}]'"#,
            &[(Some(1), "123")],
        );
        rig.runner.fetch("123").await.unwrap();

        match rig.runner.status("123", Some(1)).unwrap() {
            InsuranceResponse::Success { message, insurance, file_id, .. } => {
                assert_eq!(message, "Insurance data is available from file");
                assert!(insurance[0].is_no_insurance_sentinel());
                assert!(file_id.is_some());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_status_without_data_is_processing() {
        let rig = rig(CARGO_JSON, &[(Some(1), "123")]);
        assert_eq!(
            rig.runner.status("123", Some(1)).unwrap(),
            InsuranceResponse::processing(STATUS_PROCESSING)
        );
    }

    #[test]
    fn test_status_for_carrier_saved_by_another_company() {
        let rig = rig(CARGO_JSON, &[(Some(2), "123")]);
        match rig.runner.status("123", Some(1)).unwrap() {
            InsuranceResponse::NotInCompany { from_company_id, legal_name, .. } => {
                assert_eq!(from_company_id, Some(2));
                assert_eq!(legal_name.as_deref(), Some("ACME FREIGHT LLC"));
            }
            other => panic!("expected not_in_company, got {:?}", other),
        }
        let err = rig.runner.status("555", Some(1)).unwrap_err();
        assert_eq!(err.to_string(), "Carrier with MC# 555 not found");
    }

    #[test]
    fn test_processing_payload_shape() {
        let value = serde_json::to_value(InsuranceResponse::processing(STATUS_PROCESSING)).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["insurance_carrier"], "Processing");
        assert_eq!(value["insurance"][0]["type"], "Processing");
    }
}
