// =============================================================================
// circuit_breaker.rs — UPSTREAM TRIP SWITCH
// =============================================================================
//
// One breaker per government upstream: QCMobile and the census dataset.
// After `failure_threshold` consecutive failures the breaker opens and
// calls short-circuit without touching the network. Once
// `reset_timeout` has passed a probe is let through; `success_threshold`
// probe successes close it again, a single probe failure reopens it.
//
// QCMobile goes down on weekends with some regularity. Hammering it while it
// is down just gets the web key throttled for Monday too.
// =============================================================================

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

struct Tally {
    state: BreakerState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

pub struct CircuitBreaker {
    upstream: String,
    tally: Mutex<Tally>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(
        upstream: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            tally: Mutex::new(Tally {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
                trips: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Build a breaker using the thresholds from config.
    pub fn from_config(upstream: impl Into<String>, config: &crate::config::Config) -> Self {
        Self::new(
            upstream,
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_reset_timeout,
            config.circuit_breaker_success_threshold,
        )
    }

    /// Whether the next call may go out. An expired open breaker moves to
    /// half-open here and lets the probe through.
    pub fn allow_request(&self) -> bool {
        let mut tally = self.tally.lock();
        match tally.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let expired = tally
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if expired {
                    info!(upstream = %self.upstream, "Breaker half-open, sending a probe");
                    tally.state = BreakerState::HalfOpen;
                    tally.probe_successes = 0;
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut tally = self.tally.lock();
        match tally.state {
            BreakerState::Closed => tally.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                tally.probe_successes += 1;
                if tally.probe_successes >= self.success_threshold {
                    info!(upstream = %self.upstream, "Breaker closed, upstream is answering again");
                    tally.state = BreakerState::Closed;
                    tally.consecutive_failures = 0;
                    tally.probe_successes = 0;
                    tally.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut tally = self.tally.lock();
        match tally.state {
            BreakerState::Closed => {
                tally.consecutive_failures += 1;
                if tally.consecutive_failures >= self.failure_threshold {
                    warn!(
                        upstream = %self.upstream,
                        failures = tally.consecutive_failures,
                        "Breaker tripped"
                    );
                    tally.state = BreakerState::Open;
                    tally.opened_at = Some(Instant::now());
                    tally.trips += 1;
                }
            }
            BreakerState::HalfOpen => {
                warn!(upstream = %self.upstream, "Probe failed, breaker back open");
                tally.state = BreakerState::Open;
                tally.opened_at = Some(Instant::now());
                tally.trips += 1;
            }
            BreakerState::Open => tally.opened_at = Some(Instant::now()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.tally.lock().state
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let tally = self.tally.lock();
        BreakerSnapshot {
            upstream: self.upstream.clone(),
            state: tally.state,
            consecutive_failures: tally.consecutive_failures,
            trips: tally.trips,
        }
    }
}

/// Breaker state as reported on the metrics endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub upstream: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("qcmobile", 2, Duration::from_secs(60), 1);
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.snapshot().trips, 1);
    }

    #[test]
    fn test_success_breaks_the_streak() {
        let cb = CircuitBreaker::new("dataset", 2, Duration::from_secs(60), 1);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_probe_after_reset_timeout() {
        let cb = CircuitBreaker::new("captcha", 1, Duration::ZERO, 1);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new("captcha", 1, Duration::ZERO, 1);
        cb.record_failure();
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.snapshot().trips, 2);
    }
}
