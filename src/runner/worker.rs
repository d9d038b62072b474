// =============================================================================
// runner/worker.rs — THE NIGHT SHIFT
// =============================================================================
//
// Claims queued scrape jobs and runs them with the long deadline. A job is
// acked once the scrape is done, however it went; a failed scrape is not
// retried. A job is only redelivered when the worker never got to ack it
// (crash, kill, shutdown mid-scrape), via queue recovery at the next start.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::insurance::shutdown_requested;

use super::ScraperRunner;

/// How long an idle worker naps before checking the queue again.
const IDLE_POLL: Duration = Duration::from_millis(500);

pub async fn run_worker(worker_id: usize, runner: Arc<ScraperRunner>, mut shutdown: watch::Receiver<bool>) {
    info!(worker = worker_id, "Scrape worker online");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match runner.queue().claim().await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Could not claim a scrape job");
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL * 4) => continue,
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        };

        let job = &claimed.job;
        let result = tokio::select! {
            r = runner.process_job(job) => r,
            _ = shutdown_requested(&mut shutdown) => {
                // Dropping the scrape kills its process; the job stays in
                // processing and comes back at the next start.
                warn!(worker = worker_id, job_id = %job.id, "Shutdown mid-scrape, leaving job for recovery");
                break;
            }
        };

        if let Err(e) = result {
            error!(worker = worker_id, job_id = %job.id, mc_number = %job.mc_number, error = %e, "Scrape job failed");
        }
        if let Err(e) = runner.queue().ack(&claimed).await {
            error!(worker = worker_id, job_id = %job.id, error = %e, "Could not ack scrape job");
        }
    }

    info!(worker = worker_id, "Scrape worker offline");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::MetricsCollector;
    use crate::runner::queue::{JobQueue, MemoryQueue, ScrapeJob};
    use crate::runner::subprocess::testing::shell;
    use crate::store::{NewCarrier, Store};
    use chrono::Utc;
    use tokio::time::Instant;

    fn runner(script: &str, queue: Arc<MemoryQueue>) -> Arc<ScraperRunner> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_carrier(&NewCarrier {
                mc_number: "123",
                ..NewCarrier::default()
            })
            .unwrap();
        Arc::new(ScraperRunner::new(
            store,
            queue,
            shell(script),
            Arc::new(MetricsCollector::new()),
            &Config::for_tests(),
        ))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(Instant::now() < deadline, "condition never became true");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_runs_and_acks_a_job() {
        let queue = Arc::new(MemoryQueue::new());
        let runner = runner(r#"echo '[{"type":"Cargo","insurance_carrier":"NIGHT SHIFT INS"}]'"#, queue.clone());
        queue.enqueue(&ScrapeJob::new("123", Utc::now())).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(0, runner.clone(), rx));

        let store = runner.store().clone();
        eventually(|| {
            store.carriers_by_mc("123").unwrap()[0].insurance.insurance_carrier.as_deref() == Some("NIGHT SHIFT INS")
        })
        .await;
        eventually(|| queue.processing_len() == 0).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_scrape_is_still_acked() {
        let queue = Arc::new(MemoryQueue::new());
        let runner = runner(r#"echo '[{"error":"boom"}]'"#, queue.clone());
        queue.enqueue(&ScrapeJob::new("123", Utc::now())).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(0, runner, rx));
        eventually(|| queue.pending_len() == 0 && queue.processing_len() == 0).await;

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(queue.recover(3).await.unwrap().requeued, 0);
    }

    #[tokio::test]
    async fn test_shutdown_mid_scrape_leaves_job_for_recovery() {
        let queue = Arc::new(MemoryQueue::new());
        let runner = runner("exec sleep 30", queue.clone());
        queue.enqueue(&ScrapeJob::new("123", Utc::now())).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(0, runner, rx));
        eventually(|| queue.processing_len() == 1).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(queue.recover(3).await.unwrap().requeued, 1);
    }
}
