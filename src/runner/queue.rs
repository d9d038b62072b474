// =============================================================================
// runner/queue.rs — THE TO-DO LIST THAT SURVIVES A CRASH
// =============================================================================
//
// Background scrapes go through a reliable queue so a dead worker doesn't
// silently take its job with it:
//
//   enqueue  LPUSH pending
//   claim    LMOVE pending -> processing   (atomic hand-off)
//   ack      LREM processing
//   recover  everything still in processing goes back to pending at
//            startup, one delivery older; jobs past the cap are dropped
//
// The in-memory queue has the same shape for tests and the `memory`
// backend. It dies with the process, which is the point of having Redis.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: String,
    pub mc_number: String,
    /// The attempt timestamp every write from this job is tagged with.
    pub attempt_at: DateTime<Utc>,
    /// How many times this job has been handed to a worker.
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl ScrapeJob {
    pub fn new(mc_number: &str, attempt_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mc_number: mc_number.to_string(),
            attempt_at,
            deliveries: 1,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job a worker holds, plus the exact payload needed to ack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub job: ScrapeJob,
    raw: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: u64,
    pub dropped: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &ScrapeJob) -> Result<(), QueueError>;

    /// Take the oldest pending job, if any. Does not block.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), QueueError>;

    /// Put in-flight jobs left by a previous run back on the pending list.
    async fn recover(&self, max_deliveries: u32) -> Result<RecoveryReport, QueueError>;
}

/// Decide what happens to one orphaned payload during recovery.
fn redeliver(raw: &str, max_deliveries: u32) -> Option<String> {
    let mut job: ScrapeJob = match serde_json::from_str(raw) {
        Ok(job) => job,
        Err(e) => {
            warn!(error = %e, "Dropping unreadable scrape job");
            return None;
        }
    };
    job.deliveries += 1;
    if job.deliveries > max_deliveries {
        warn!(
            job_id = %job.id,
            mc_number = %job.mc_number,
            deliveries = job.deliveries - 1,
            "Scrape job hit its delivery cap, dropping it"
        );
        return None;
    }
    serde_json::to_string(&job).ok()
}

fn decode(raw: String) -> Result<ClaimedJob, QueueError> {
    Ok(ClaimedJob {
        job: serde_json::from_str(&raw)?,
        raw,
    })
}

// -----------------------------------------------------------------------------
// Redis
// -----------------------------------------------------------------------------

pub struct RedisQueue {
    con: ConnectionManager,
    pending: String,
    processing: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, pending: &str, processing: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        info!(pending = pending, processing = processing, "Redis job queue connected");
        Ok(Self {
            con,
            pending: pending.to_string(),
            processing: processing.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &ScrapeJob) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)?;
        let mut con = self.con.clone();
        let _: i64 = con.lpush(&self.pending, raw).await?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut con = self.con.clone();
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(&self.pending)
            .arg(&self.processing)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut con)
            .await?;
        match raw {
            Some(raw) => match decode(raw.clone()) {
                Ok(claimed) => Ok(Some(claimed)),
                Err(e) => {
                    // Poison pill; get it out of the processing list.
                    let _: i64 = con.lrem(&self.processing, 1, raw).await?;
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), QueueError> {
        let mut con = self.con.clone();
        let _: i64 = con.lrem(&self.processing, 1, &claimed.raw).await?;
        Ok(())
    }

    async fn recover(&self, max_deliveries: u32) -> Result<RecoveryReport, QueueError> {
        let mut con = self.con.clone();
        let orphans: Vec<String> = con.lrange(&self.processing, 0, -1).await?;
        let mut report = RecoveryReport::default();

        for raw in orphans {
            let _: i64 = con.lrem(&self.processing, 1, &raw).await?;
            match redeliver(&raw, max_deliveries) {
                Some(job) => {
                    // Right end, so recovered jobs are claimed first.
                    let _: i64 = con.rpush(&self.pending, job).await?;
                    report.requeued += 1;
                }
                None => report.dropped += 1,
            }
        }
        Ok(report)
    }
}

// -----------------------------------------------------------------------------
// In-memory
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Lists {
    pending: VecDeque<String>,
    processing: Vec<String>,
}

#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<Lists>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.lists.lock().pending.len()
    }

    pub fn processing_len(&self) -> usize {
        self.lists.lock().processing.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &ScrapeJob) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)?;
        self.lists.lock().pending.push_front(raw);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let raw = {
            let mut lists = self.lists.lock();
            match lists.pending.pop_back() {
                Some(raw) => {
                    lists.processing.push(raw.clone());
                    raw
                }
                None => return Ok(None),
            }
        };
        decode(raw).map(Some)
    }

    async fn ack(&self, claimed: &ClaimedJob) -> Result<(), QueueError> {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.processing.iter().position(|r| *r == claimed.raw) {
            lists.processing.remove(pos);
        }
        Ok(())
    }

    async fn recover(&self, max_deliveries: u32) -> Result<RecoveryReport, QueueError> {
        let mut lists = self.lists.lock();
        let orphans = std::mem::take(&mut lists.processing);
        let mut report = RecoveryReport::default();
        for raw in orphans {
            match redeliver(&raw, max_deliveries) {
                Some(job) => {
                    lists.pending.push_back(job);
                    report.requeued += 1;
                }
                None => report.dropped += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(mc: &str) -> ScrapeJob {
        ScrapeJob::new(mc, Utc::now())
    }

    #[tokio::test]
    async fn test_jobs_come_out_in_arrival_order() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("1")).await.unwrap();
        queue.enqueue(&job("2")).await.unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.job.mc_number, "1");
        assert_eq!(second.job.mc_number, "2");
        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.processing_len(), 2);
    }

    #[tokio::test]
    async fn test_ack_removes_from_processing() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("1")).await.unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();
        queue.ack(&claimed).await.unwrap();
        assert_eq!(queue.processing_len(), 0);
        assert_eq!(queue.recover(3).await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_unacked_job_is_redelivered_first_with_bumped_count() {
        let queue = MemoryQueue::new();
        let original = job("crashed");
        queue.enqueue(&original).await.unwrap();
        queue.claim().await.unwrap().unwrap();
        queue.enqueue(&job("later")).await.unwrap();

        let report = queue.recover(3).await.unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, dropped: 0 });

        let again = queue.claim().await.unwrap().unwrap();
        assert_eq!(again.job.id, original.id);
        assert_eq!(again.job.attempt_at, original.attempt_at);
        assert_eq!(again.job.deliveries, 2);
    }

    #[tokio::test]
    async fn test_job_past_delivery_cap_is_dropped() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job("cursed")).await.unwrap();

        for _ in 0..2 {
            queue.claim().await.unwrap().unwrap();
            assert_eq!(queue.recover(3).await.unwrap().requeued, 1);
        }
        let third = queue.claim().await.unwrap().unwrap();
        assert_eq!(third.job.deliveries, 3);

        assert_eq!(queue.recover(3).await.unwrap(), RecoveryReport { requeued: 0, dropped: 1 });
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_garbage_payload_is_not_redelivered() {
        assert_eq!(redeliver("{not json", 3), None);
    }
}
