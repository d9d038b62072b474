// =============================================================================
// publisher.rs — TELLING THE BROKERAGE APP THE PAPERWORK ARRIVED
// =============================================================================
//
// Fan-out writes drop an InsuranceEvent on a crossbeam channel. This loop
// drains that channel in batches and pushes every event to Redis twice:
//
//   PUBLISH  for whoever is listening right now
//   ZADD     into a sorted set scored by attempt time, for whoever isn't
//
// Pub/sub forgets; the sorted set doesn't. A web app that was restarting
// when a scrape landed can catch up from the history.
// =============================================================================

use anyhow::Result;
use crossbeam_channel::{Receiver, TryRecvError};
use portable_atomic::{AtomicU64, Ordering};
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::insurance::shutdown_requested;
use crate::metrics::MetricsCollector;
use crate::models::InsuranceEvent;

const BATCH_SIZE: usize = 50;
const IDLE_POLL: Duration = Duration::from_millis(100);

pub struct RedisPublisher {
    config: Arc<Config>,
    receiver: Receiver<InsuranceEvent>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<MetricsCollector>,
    stats: Arc<PublisherStats>,
}

#[derive(Default)]
pub struct PublisherStats {
    pub events_persisted: AtomicU64,
    pub publish_errors: AtomicU64,
    pub batches_sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PublisherSnapshot {
    pub events_persisted: u64,
    pub publish_errors: u64,
    pub batches_sent: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Drain {
    /// The batch has something in it.
    Ready,
    Empty,
    /// Every sender is gone; whatever is in the batch is the last of it.
    Closed,
}

fn drain_into(receiver: &Receiver<InsuranceEvent>, batch: &mut Vec<InsuranceEvent>) -> Drain {
    while batch.len() < BATCH_SIZE {
        match receiver.try_recv() {
            Ok(event) => batch.push(event),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return Drain::Closed,
        }
    }
    if batch.is_empty() {
        Drain::Empty
    } else {
        Drain::Ready
    }
}

/// Sorted-set score: attempt time in fractional seconds, so history orders
/// by when the scrape was requested rather than when it finished.
fn score(event: &InsuranceEvent) -> f64 {
    event.attempt_at.timestamp_micros() as f64 / 1_000_000.0
}

impl RedisPublisher {
    pub fn new(
        config: Arc<Config>,
        receiver: Receiver<InsuranceEvent>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<MetricsCollector>,
    ) -> (Self, Arc<PublisherStats>) {
        let stats = Arc::new(PublisherStats::default());
        (
            Self {
                config,
                receiver,
                shutdown,
                metrics,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            channel = %self.config.redis_channel,
            sorted_set = %self.config.redis_sorted_set,
            "Insurance event publisher starting"
        );

        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut con = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(con) => break con,
                Err(e) => {
                    warn!(error = %e, "Redis unreachable, retrying in 5 seconds");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown_requested(&mut self.shutdown) => {}
                    }
                    if *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        };

        let mut batch = Vec::with_capacity(BATCH_SIZE);
        loop {
            batch.clear();
            let stopping = *self.shutdown.borrow();
            let drain = drain_into(&self.receiver, &mut batch);

            if !batch.is_empty() {
                if let Err(e) = self.publish_batch(&mut con, &batch).await {
                    error!(error = %e, batch_size = batch.len(), "Insurance events not published");
                    self.stats
                        .publish_errors
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                }
            }

            match drain {
                Drain::Closed => {
                    info!("Event channel closed, publisher done");
                    return Ok(());
                }
                Drain::Empty if stopping => {
                    info!("Publisher drained, shutting down");
                    return Ok(());
                }
                Drain::Empty => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown_requested(&mut self.shutdown) => {}
                    }
                }
                Drain::Ready => {}
            }
        }
    }

    async fn publish_batch(
        &self,
        con: &mut redis::aio::MultiplexedConnection,
        batch: &[InsuranceEvent],
    ) -> Result<()> {
        for event in batch {
            let json = serde_json::to_string(event)?;

            let _: i64 = con.publish(&self.config.redis_channel, &json).await?;
            self.metrics.increment_events_published();

            let _: i64 = con.zadd(&self.config.redis_sorted_set, &json, score(event)).await?;
            self.stats.events_persisted.fetch_add(1, Ordering::Relaxed);

            info!(mc_number = %event.mc_number, "Insurance event published {}", event);
        }
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        debug!(batch_size = batch.len(), "Event batch sent");
        Ok(())
    }
}
