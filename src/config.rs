// =============================================================================
// config.rs — THE CONTROL PANEL
// =============================================================================
//
// Every endpoint, key, timeout and knob the carrier pipeline touches lives
// here. Nothing is hardcoded in the components themselves: they receive an
// Arc<Config> at construction and read what they need from it.
//
// All values can be overridden via environment variables prefixed with
// CARRIER_INTEL_. A .env file is honored if one is lying around.
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which job queue backs the background scrape workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Redis reliable queue. Survives process restarts.
    Redis,
    /// In-process queue. Jobs die with the process; fine for dev and tests.
    Memory,
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // SERVICE
    // =========================================================================

    /// Address the HTTP API binds to.
    pub api_addr: String,

    /// SQLite file holding saved carriers and their insurance documents.
    pub database_path: PathBuf,

    pub log_format: LogFormat,

    // =========================================================================
    // QUEUE + EVENTS
    // =========================================================================

    pub queue_backend: QueueBackend,

    /// Redis connection URL for the job queue and event broadcast.
    pub redis_url: String,

    /// Pending scrape jobs.
    pub redis_queue: String,

    /// Jobs a worker has claimed but not yet acknowledged. Anything left in
    /// here after a crash gets pushed back onto the pending list at startup.
    pub redis_processing: String,

    /// Pub/sub channel for insurance-updated events.
    pub redis_channel: String,

    /// Sorted set keeping every insurance event, scored by timestamp.
    pub redis_sorted_set: String,

    /// How many times a job may be handed out before it is dropped.
    pub max_deliveries: u32,

    /// Background scrape workers.
    pub worker_count: usize,

    // =========================================================================
    // GOVERNMENT APIS
    // =========================================================================

    /// QCMobile services root. Carrier, docket and authority endpoints hang
    /// off this.
    pub fmcsa_base_url: String,

    /// Default QCMobile web key. Callers may pass their own per request.
    pub fmcsa_web_key: Option<String>,

    /// DOT open-data (Socrata) carrier census dataset.
    pub dataset_url: String,

    /// Pause before every government API call. QCMobile throttles hard.
    pub request_pause: Duration,

    pub http_timeout: Duration,

    // =========================================================================
    // CAPTCHA SOLVER
    // =========================================================================

    pub captcha_api_key: String,
    pub captcha_submit_url: String,
    pub captcha_result_url: String,
    pub captcha_poll_interval: Duration,
    pub captcha_max_wait: Duration,
    pub captcha_attempts: u32,
    pub captcha_backoff: Duration,

    // =========================================================================
    // INSURANCE PORTAL
    // =========================================================================

    /// L&I carrier search page. Step one of the scrape.
    pub portal_url: String,

    /// Chrome binary to drive. Auto-detected when unset.
    pub chrome_executable: Option<PathBuf>,

    /// How long each step waits for its page element.
    pub step_wait: Duration,

    /// How long the final step waits for the results table.
    pub results_wait: Duration,

    /// Pause after each step so the portal's scripts can catch up.
    pub step_settle: Duration,

    /// Extra pause once the results table shows up.
    pub results_settle: Duration,

    // =========================================================================
    // SCRAPER RUNNER
    // =========================================================================

    /// Deadline for the scrape that runs inside the request.
    pub foreground_timeout: Duration,

    /// Deadline for the queued background scrape.
    pub background_timeout: Duration,

    /// Time between asking a scraper process to stop and killing it.
    pub terminate_grace: Duration,

    /// Program spawned for each scrape attempt. Defaults to this binary.
    pub scraper_program: Option<PathBuf>,

    // =========================================================================
    // CIRCUIT BREAKER
    // =========================================================================

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,
}

impl Config {
    /// Load configuration from the environment with defaults that work out
    /// of the box against the real government endpoints.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Config {
            api_addr: env_or_default("CARRIER_INTEL_API_ADDR", "0.0.0.0:8080"),
            database_path: PathBuf::from(env_or_default(
                "CARRIER_INTEL_DATABASE_PATH",
                "carrier_intel.db",
            )),
            log_format: match env_or_default("CARRIER_INTEL_LOG_FORMAT", "pretty")
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },

            queue_backend: match env_or_default("CARRIER_INTEL_QUEUE_BACKEND", "redis")
                .to_lowercase()
                .as_str()
            {
                "memory" => QueueBackend::Memory,
                _ => QueueBackend::Redis,
            },
            redis_url: env_or_default("CARRIER_INTEL_REDIS_URL", "redis://127.0.0.1:6379"),
            redis_queue: env_or_default("CARRIER_INTEL_REDIS_QUEUE", "insurance:jobs"),
            redis_processing: env_or_default(
                "CARRIER_INTEL_REDIS_PROCESSING",
                "insurance:jobs:processing",
            ),
            redis_channel: env_or_default("CARRIER_INTEL_REDIS_CHANNEL", "insurance:events"),
            redis_sorted_set: env_or_default(
                "CARRIER_INTEL_REDIS_SORTED_SET",
                "insurance:events:history",
            ),
            max_deliveries: env_or_default("CARRIER_INTEL_MAX_DELIVERIES", "3")
                .parse().unwrap_or(3),
            worker_count: env_or_default("CARRIER_INTEL_WORKER_COUNT", "2")
                .parse().unwrap_or(2),

            fmcsa_base_url: env_or_default(
                "CARRIER_INTEL_FMCSA_BASE_URL",
                "https://mobile.fmcsa.dot.gov/qc/services",
            ),
            fmcsa_web_key: env_opt("CARRIER_INTEL_FMCSA_WEB_KEY"),
            dataset_url: env_or_default(
                "CARRIER_INTEL_DATASET_URL",
                "https://data.transportation.gov/resource/az4n-8mr2.json",
            ),
            request_pause: Duration::from_millis(
                env_or_default("CARRIER_INTEL_REQUEST_PAUSE_MS", "1000").parse().unwrap_or(1000)
            ),
            http_timeout: Duration::from_secs(
                env_or_default("CARRIER_INTEL_HTTP_TIMEOUT_SECS", "10").parse().unwrap_or(10)
            ),

            captcha_api_key: env_or_default("CARRIER_INTEL_CAPTCHA_API_KEY", ""),
            captcha_submit_url: env_or_default(
                "CARRIER_INTEL_CAPTCHA_SUBMIT_URL",
                "https://2captcha.com/in.php",
            ),
            captcha_result_url: env_or_default(
                "CARRIER_INTEL_CAPTCHA_RESULT_URL",
                "https://2captcha.com/res.php",
            ),
            captcha_poll_interval: Duration::from_secs(
                env_or_default("CARRIER_INTEL_CAPTCHA_POLL_SECS", "5").parse().unwrap_or(5)
            ),
            captcha_max_wait: Duration::from_secs(
                env_or_default("CARRIER_INTEL_CAPTCHA_MAX_WAIT_SECS", "120").parse().unwrap_or(120)
            ),
            captcha_attempts: env_or_default("CARRIER_INTEL_CAPTCHA_ATTEMPTS", "3")
                .parse().unwrap_or(3),
            captcha_backoff: Duration::from_secs(
                env_or_default("CARRIER_INTEL_CAPTCHA_BACKOFF_SECS", "10").parse().unwrap_or(10)
            ),

            portal_url: env_or_default(
                "CARRIER_INTEL_PORTAL_URL",
                "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_carrquery.prc_carrlist",
            ),
            chrome_executable: env_opt("CARRIER_INTEL_CHROME_EXECUTABLE").map(PathBuf::from),
            step_wait: Duration::from_secs(
                env_or_default("CARRIER_INTEL_STEP_WAIT_SECS", "15").parse().unwrap_or(15)
            ),
            results_wait: Duration::from_secs(
                env_or_default("CARRIER_INTEL_RESULTS_WAIT_SECS", "20").parse().unwrap_or(20)
            ),
            step_settle: Duration::from_millis(
                env_or_default("CARRIER_INTEL_STEP_SETTLE_MS", "2000").parse().unwrap_or(2000)
            ),
            results_settle: Duration::from_millis(
                env_or_default("CARRIER_INTEL_RESULTS_SETTLE_MS", "5000").parse().unwrap_or(5000)
            ),

            foreground_timeout: Duration::from_secs(
                env_or_default("CARRIER_INTEL_FOREGROUND_TIMEOUT_SECS", "15").parse().unwrap_or(15)
            ),
            background_timeout: Duration::from_secs(
                env_or_default("CARRIER_INTEL_BACKGROUND_TIMEOUT_SECS", "300").parse().unwrap_or(300)
            ),
            terminate_grace: Duration::from_secs(
                env_or_default("CARRIER_INTEL_TERMINATE_GRACE_SECS", "5").parse().unwrap_or(5)
            ),
            scraper_program: env_opt("CARRIER_INTEL_SCRAPER_PROGRAM").map(PathBuf::from),

            circuit_breaker_failure_threshold: env_or_default(
                "CARRIER_INTEL_CB_FAILURE_THRESHOLD", "5"
            ).parse().unwrap_or(5),
            circuit_breaker_reset_timeout: Duration::from_secs(
                env_or_default("CARRIER_INTEL_CB_RESET_TIMEOUT_SECS", "60").parse().unwrap_or(60)
            ),
            circuit_breaker_success_threshold: env_or_default(
                "CARRIER_INTEL_CB_SUCCESS_THRESHOLD", "1"
            ).parse().unwrap_or(1),
        }
    }

    /// A configuration suitable for unit tests: no pauses, short waits,
    /// in-memory queue, nothing pointed at a real host.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Config {
            api_addr: "127.0.0.1:0".to_string(),
            database_path: PathBuf::from(":memory:"),
            log_format: LogFormat::Pretty,
            queue_backend: QueueBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_queue: "test:jobs".to_string(),
            redis_processing: "test:jobs:processing".to_string(),
            redis_channel: "test:events".to_string(),
            redis_sorted_set: "test:events:history".to_string(),
            max_deliveries: 3,
            worker_count: 1,
            fmcsa_base_url: "https://fmcsa.test/qc/services".to_string(),
            fmcsa_web_key: Some("test-key".to_string()),
            dataset_url: "https://dataset.test/resource/az4n-8mr2.json".to_string(),
            request_pause: Duration::ZERO,
            http_timeout: Duration::from_secs(1),
            captcha_api_key: "captcha-key".to_string(),
            captcha_submit_url: "https://captcha.test/in.php".to_string(),
            captcha_result_url: "https://captcha.test/res.php".to_string(),
            captcha_poll_interval: Duration::from_secs(5),
            captcha_max_wait: Duration::from_secs(120),
            captcha_attempts: 3,
            captcha_backoff: Duration::from_secs(10),
            portal_url: "https://portal.test/LIVIEW/pkg_carrquery.prc_carrlist".to_string(),
            chrome_executable: None,
            step_wait: Duration::from_millis(50),
            results_wait: Duration::from_millis(50),
            step_settle: Duration::ZERO,
            results_settle: Duration::ZERO,
            foreground_timeout: Duration::from_secs(2),
            background_timeout: Duration::from_secs(5),
            terminate_grace: Duration::from_millis(200),
            scraper_program: None,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_reset_timeout: Duration::from_secs(60),
            circuit_breaker_success_threshold: 1,
        }
    }
}

/// Read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an optional environment variable; blank counts as unset.
fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
