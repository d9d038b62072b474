// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - Counting every way the government can let us down
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters, no locks. Every component that does something worth
// counting gets an Arc of this; the API serves a snapshot at /metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::store::FanoutReport;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub lookups: u64,
    pub lookup_errors: u64,
    pub foreground_scrapes: u64,
    pub foreground_timeouts: u64,
    pub background_scrapes: u64,
    pub scrape_failures: u64,
    pub fanout_writes: u64,
    pub stale_writes_rejected: u64,
    pub jobs_enqueued: u64,
    pub jobs_recovered: u64,
    pub events_published: u64,
    pub uptime_seconds: u64,
    pub status: String,
}

pub struct MetricsCollector {
    lookups: AtomicU64,
    lookup_errors: AtomicU64,
    foreground_scrapes: AtomicU64,
    foreground_timeouts: AtomicU64,
    background_scrapes: AtomicU64,
    scrape_failures: AtomicU64,
    fanout_writes: AtomicU64,
    stale_writes_rejected: AtomicU64,
    jobs_enqueued: AtomicU64,
    jobs_recovered: AtomicU64,
    events_published: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            lookups: AtomicU64::new(0),
            lookup_errors: AtomicU64::new(0),
            foreground_scrapes: AtomicU64::new(0),
            foreground_timeouts: AtomicU64::new(0),
            background_scrapes: AtomicU64::new(0),
            scrape_failures: AtomicU64::new(0),
            fanout_writes: AtomicU64::new(0),
            stale_writes_rejected: AtomicU64::new(0),
            jobs_enqueued: AtomicU64::new(0),
            jobs_recovered: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_lookup(&self, ok: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.lookup_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_foreground_scrapes(&self) {
        self.foreground_scrapes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_foreground_timeouts(&self) {
        self.foreground_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_background_scrapes(&self) {
        self.background_scrapes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_scrape_failures(&self) {
        self.scrape_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fanout(&self, report: &FanoutReport) {
        self.fanout_writes.fetch_add(report.updated as u64, Ordering::Relaxed);
        self.stale_writes_rejected.fetch_add(report.stale as u64, Ordering::Relaxed);
    }

    pub fn increment_jobs_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_jobs_recovered(&self, count: u64) {
        self.jobs_recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            foreground_scrapes: self.foreground_scrapes.load(Ordering::Relaxed),
            foreground_timeouts: self.foreground_timeouts.load(Ordering::Relaxed),
            background_scrapes: self.background_scrapes.load(Ordering::Relaxed),
            scrape_failures: self.scrape_failures.load(Ordering::Relaxed),
            fanout_writes: self.fanout_writes.load(Ordering::Relaxed),
            stale_writes_rejected: self.stale_writes_rejected.load(Ordering::Relaxed),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_recovered: self.jobs_recovered.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            status: "operational".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_errors_count_as_lookups_too() {
        let metrics = MetricsCollector::new();
        metrics.record_lookup(true);
        metrics.record_lookup(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.lookups, 2);
        assert_eq!(snap.lookup_errors, 1);
    }

    #[test]
    fn test_fanout_report_splits_into_writes_and_stale() {
        let metrics = MetricsCollector::new();
        metrics.record_fanout(&FanoutReport {
            matched: 3,
            updated: 2,
            stale: 1,
            documents_added: 3,
        });
        let snap = metrics.snapshot();
        assert_eq!(snap.fanout_writes, 2);
        assert_eq!(snap.stale_writes_rejected, 1);
        assert_eq!(snap.status, "operational");
    }
}
