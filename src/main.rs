//  ██████╗ █████╗ ██████╗ ██████╗ ██╗███████╗██████╗
// ██╔════╝██╔══██╗██╔══██╗██╔══██╗██║██╔════╝██╔══██╗
// ██║     ███████║██████╔╝██████╔╝██║█████╗  ██████╔╝
// ██║     ██╔══██║██╔══██╗██╔══██╗██║██╔══╝  ██╔══██╗
// ╚██████╗██║  ██║██║  ██║██║  ██║██║███████╗██║  ██║
//  ╚═════╝╚═╝  ╚═╝╚═╝  ╚═╝╚═╝  ╚═╝╚═╝╚══════╝╚═╝  ╚═╝
//
// I N T E L   E N G I N E
//
// Who is this carrier, are they allowed to haul freight, and is anybody
// actually insuring them? Two government APIs, one government website from
// a simpler time, a paid CAPTCHA farm, and a headless Chrome to tie them
// together.
//
// Modes:
//   serve         HTTP API + background scrape workers + event publisher
//   scrape <MC>   one insurance scrape, JSON on stdout (what `serve` spawns)
//   lookup        one carrier profile, JSON on stdout

mod api;
mod circuit_breaker;
mod config;
mod insurance;
mod lookup;
mod metrics;
mod models;
mod normalize;
mod publisher;
mod runner;
mod store;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::AppState;
use crate::config::{Config, LogFormat, QueueBackend};
use crate::insurance::captcha::{CaptchaSolver, TwoCaptcha};
use crate::insurance::portal::ChromePortal;
use crate::insurance::{shutdown_requested, InsuranceScraper};
use crate::lookup::http::ReqwestJson;
use crate::lookup::Aggregator;
use crate::metrics::MetricsCollector;
use crate::models::{InsuranceEvent, ScrapeOutcome};
use crate::publisher::RedisPublisher;
use crate::runner::queue::{JobQueue, MemoryQueue, RedisQueue};
use crate::runner::subprocess::ScraperCommand;
use crate::runner::{worker, ScraperRunner};
use crate::store::Store;

#[derive(Debug, Parser)]
#[command(name = "carrier_intel_engine", version, about = "Carrier profile and insurance intelligence")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API, the scrape workers and the event publisher (default)
    Serve {
        /// Overrides the configured bind address
        #[arg(long, env = "CARRIER_INTEL_API_ADDR")]
        addr: Option<String>,
    },
    /// Scrape one carrier's insurance and print it as JSON
    Scrape {
        mc_number: String,
        /// Treat EOF on stdin as a stop request (set by the scrape runner)
        #[arg(long)]
        stdin_shutdown: bool,
    },
    /// Look up one carrier profile and print it as JSON
    Lookup {
        #[arg(long)]
        mc: Option<String>,
        #[arg(long)]
        dot: Option<String>,
        /// QCMobile web key; falls back to the configured one
        #[arg(long)]
        access_key: Option<String>,
    },
}

fn init_tracing(format: LogFormat, stdout_is_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // When stdout carries the result, logs must stay out of it.
    let writer = if stdout_is_output {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };
    let builder = fmt().with_env_filter(filter).with_writer(writer).with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(!stdout_is_output)
            .init(),
    }
}

/// Ctrl-C, or SIGTERM where there is such a thing.
async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();

    let command = cli.command.unwrap_or(Command::Serve { addr: None });
    init_tracing(config.log_format, !matches!(command, Command::Serve { .. }));

    match command {
        Command::Serve { addr } => {
            if let Some(addr) = addr {
                config.api_addr = addr;
            }
            serve(Arc::new(config)).await
        }
        Command::Scrape { mc_number, stdin_shutdown } => {
            let shutdown = scrape_shutdown(stdin_shutdown, std::io::stdin());
            let outcome = scrape(&config, &mc_number, shutdown).await;
            println!("{}", outcome.to_json());
            Ok(())
        }
        Command::Lookup { mc, dot, access_key } => {
            let http = Arc::new(ReqwestJson::new(&config)?);
            let aggregator = Aggregator::new(http, &config);
            let key = access_key
                .or_else(|| config.fmcsa_web_key.clone())
                .unwrap_or_default();
            let record = aggregator
                .lookup_record(mc.as_deref(), dot.as_deref(), &key)
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════
// SCRAPE MODE
// ═══════════════════════════════════════════

/// Stop requests for scrape mode. Signals always count; EOF on `input` only
/// when the runner asked for it, since a detached or `</dev/null` stdin is
/// at EOF from the start.
fn scrape_shutdown<R>(stdin_shutdown: bool, mut input: R) -> watch::Receiver<bool>
where
    R: std::io::Read + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    if stdin_shutdown {
        // A plain thread, so a read that never finishes can't hold the
        // runtime open at exit.
        let stdin_tx = Arc::clone(&shutdown_tx);
        std::thread::spawn(move || {
            let mut sink = [0u8; 256];
            while matches!(input.read(&mut sink), Ok(n) if n > 0) {}
            let _ = stdin_tx.send(true);
        });
    }
    tokio::spawn(async move {
        termination().await;
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

async fn scrape(config: &Config, mc_number: &str, shutdown_rx: watch::Receiver<bool>) -> ScrapeOutcome {
    let backend = match TwoCaptcha::new(config) {
        Ok(backend) => Arc::new(backend),
        Err(e) => return ScrapeOutcome::Failed(format!("Unexpected error: {}", e)),
    };
    let solver = CaptchaSolver::new(backend, config);

    match ChromePortal::launch(config).await {
        Ok(driver) => {
            InsuranceScraper::new(driver, solver, config, shutdown_rx)
                .run(mc_number)
                .await
        }
        Err(e) => {
            error!(mc_number = mc_number, error = %e, "Could not start a browser");
            ScrapeOutcome::Failed(format!("Unexpected error: {}", e))
        }
    }
}

// ═══════════════════════════════════════════
// SERVE MODE
// ═══════════════════════════════════════════

async fn serve(config: Arc<Config>) -> anyhow::Result<()> {
    info!("🚛 CARRIER INTEL ENGINE initializing...");

    let metrics = Arc::new(MetricsCollector::new());
    let store = Arc::new(
        Store::open(&config.database_path)
            .with_context(|| format!("opening {}", config.database_path.display()))?,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue: Arc<dyn JobQueue> = match config.queue_backend {
        QueueBackend::Redis => Arc::new(
            RedisQueue::connect(&config.redis_url, &config.redis_queue, &config.redis_processing).await?,
        ),
        QueueBackend::Memory => {
            warn!("In-memory job queue: background scrapes will not survive a restart");
            Arc::new(MemoryQueue::new())
        }
    };
    let recovered = queue.recover(config.max_deliveries).await?;
    metrics.add_jobs_recovered(recovered.requeued);
    info!(
        requeued = recovered.requeued,
        dropped = recovered.dropped,
        "✅ Job queue ready"
    );

    let command = ScraperCommand::from_config(&config)?;
    let mut runner = ScraperRunner::new(store, queue, command, metrics.clone(), &config);

    // ═══════════════════════════════════════════
    // EVENT PUBLISHER (Redis only)
    // ═══════════════════════════════════════════
    let mut publisher_stats = None;
    let mut publisher_handle = None;
    if config.queue_backend == QueueBackend::Redis {
        let (event_tx, event_rx) = crossbeam_channel::bounded::<InsuranceEvent>(10_000);
        runner = runner.with_events(event_tx);
        let (publisher, stats) = RedisPublisher::new(config.clone(), event_rx, shutdown_rx.clone(), metrics.clone());
        publisher_stats = Some(stats);
        publisher_handle = Some(tokio::spawn(async move {
            if let Err(e) = publisher.run().await {
                error!(error = %e, "📤 Event publisher stopped");
            }
        }));
    }
    let runner = Arc::new(runner);

    // ═══════════════════════════════════════════
    // SCRAPE WORKERS
    // ═══════════════════════════════════════════
    let workers: Vec<_> = (0..config.worker_count.max(1))
        .map(|id| tokio::spawn(worker::run_worker(id, runner.clone(), shutdown_rx.clone())))
        .collect();

    // ═══════════════════════════════════════════
    // HTTP API
    // ═══════════════════════════════════════════
    let http = Arc::new(ReqwestJson::new(&config)?);
    let state = AppState {
        aggregator: Arc::new(Aggregator::new(http, &config).with_metrics(metrics.clone())),
        runner: runner.clone(),
        metrics: metrics.clone(),
        publisher: publisher_stats,
        default_web_key: config.fmcsa_web_key.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("binding {}", config.api_addr))?;
    let mut api_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, api::router(state))
            .with_graceful_shutdown(async move { shutdown_requested(&mut api_shutdown).await })
            .await
    });

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 CARRIER INTEL ENGINE ONLINE");
    info!("  🌐 API on http://{}", config.api_addr);
    info!("  👷 {} scrape workers", workers.len());
    info!("  ⚡ Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    termination().await;
    warn!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        if let Ok(Err(e)) = server.await {
            error!(error = %e, "API server error");
        }
        for handle in workers {
            let _ = handle.await;
        }
        if let Some(handle) = publisher_handle {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after 10s, exiting anyway");
    }

    info!("💤 CARRIER INTEL ENGINE: OFFLINE");
    Ok(())
}
