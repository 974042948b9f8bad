//! Bulk SMS Runner
//!
//! Sends one message to every number in a file through a pool of SMPP
//! sessions, paced to a messages-per-second target.
//!
//! ## Configuration
//!
//! Settings come from `bulk-sms.toml` (or `--config`), overridden by
//! `BULK_SMS_*` environment variables. Run `bulk-sms example-config` for a
//! commented template.
//!
//! ## Throughput
//!
//! `--tps 0` (or `batch.tps = 0`) derives the rate as the license ceiling
//! minus `--peak-tps`. Explicit rates above the ceiling are clamped.

use anyhow::{bail, Context, Result};
use bulk_common::{DestinationList, DispatchJob, RunState, StatusSnapshot};
use bulk_config::{AppConfig, ConfigLoader};
use bulk_dispatch::{
    message_parts, plan, resolve_tps, Dispatcher, DispatcherConfig, SmppConnector, StaticPeakUsage,
};
use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Bulk SMS dispatch over SMPP
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one message to every number in a file
    Run(RunArgs),
    /// Print an example configuration file
    ExampleConfig,
}

#[derive(Args)]
struct RunArgs {
    /// File with one destination number per line
    #[arg(long)]
    numbers: PathBuf,

    /// Source address shown to recipients
    #[arg(long)]
    sender: String,

    /// Message text
    #[arg(long, conflicts_with = "message_file", required_unless_present = "message_file")]
    message: Option<String>,

    /// Read the message text from a file
    #[arg(long)]
    message_file: Option<PathBuf>,

    /// Target messages per second (0 = license ceiling minus peak usage)
    #[arg(long)]
    tps: Option<u32>,

    /// Current peak usage of the license in msg/s
    #[arg(long, default_value_t = 0)]
    peak_tps: u32,

    /// Config file path (default: search standard locations)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

enum Outcome {
    Completed,
    Interrupted,
    Failed(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    bulk_common::logging::init_logging("bulk-sms");

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::ExampleConfig => {
            println!("{}", AppConfig::example_toml());
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    // 1. Configuration
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("Failed to load configuration")?;
    if let Some(tps) = args.tps {
        config.batch.tps = tps;
    }
    config.validate().context("Invalid configuration")?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start metrics exporter")?;
        info!(%addr, "Serving Prometheus metrics");
    }

    // 2. Run inputs
    let destinations = DestinationList::from_file(&args.numbers)
        .with_context(|| format!("Failed to load destinations from {}", args.numbers.display()))?;
    let text = match (args.message, args.message_file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read message from {}", path.display()))?
            .trim_end()
            .to_string(),
        (None, None) => bail!("--message or --message-file is required"),
    };
    let job = DispatchJob::new(args.sender, text);

    // 3. Throughput
    let parts = message_parts(&job.message_text);
    let peak_usage = StaticPeakUsage(args.peak_tps);
    let tps = resolve_tps(config.batch.tps, &peak_usage, config.batch.license_tps_ceiling).await?;
    let batch_plan = plan(tps, parts, config.batch.size)?;
    info!(
        tps,
        parts,
        batch_size = batch_plan.batch_size,
        inter_batch_delay_ms = batch_plan.inter_batch_delay.as_millis() as u64,
        destinations = destinations.len(),
        "Throughput planned"
    );

    // 4. Dispatcher
    let connector = Arc::new(SmppConnector::from_config(&config.smpp));
    let dispatcher = Dispatcher::new(
        DispatcherConfig::from_app_config(&config, &batch_plan),
        connector,
        destinations,
        job,
    )?;

    let completed = Arc::new(Notify::new());
    let hook = completed.clone();
    dispatcher.on_complete(move || hook.notify_one());

    let started = dispatcher.start_processing().await?;
    info!(run_id = ?started.run_id, workers = started.ready_workers, "Dispatch started");

    // 5. Wait for completion, failure or Ctrl-C
    let outcome = wait_for_outcome(&dispatcher, &completed).await;
    let outcome = match outcome {
        Outcome::Interrupted => {
            warn!("Interrupted, stopping dispatch");
            match dispatcher.stop_processing().await {
                Ok(_) => Outcome::Interrupted,
                Err(e) => Outcome::Failed(e.to_string()),
            }
        }
        other => other,
    };

    let status = dispatcher.status();
    dispatcher.shutdown().await;

    info!(
        dispatched = status.numbers_processed,
        submitted = status.submitted,
        total = status.total_destinations,
        batches = status.batch_counter,
        "Dispatch finished"
    );

    match outcome {
        Outcome::Completed | Outcome::Interrupted => Ok(()),
        Outcome::Failed(reason) => {
            error!(reason = %reason, "Dispatch failed");
            bail!(reason)
        }
    }
}

async fn wait_for_outcome(dispatcher: &Dispatcher, completed: &Notify) -> Outcome {
    let mut status = dispatcher.subscribe();
    let mut report = tokio::time::interval(Duration::from_secs(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = completed.notified() => return Outcome::Completed,
            _ = &mut shutdown => return Outcome::Interrupted,
            _ = report.tick() => log_status(&dispatcher.status()),
            changed = status.changed() => {
                if changed.is_err() {
                    return Outcome::Failed("dispatcher stopped unexpectedly".to_string());
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.run_state == RunState::Idle {
                    if let Some(reason) = snapshot.last_error {
                        return Outcome::Failed(reason);
                    }
                }
            }
        }
    }
}

fn log_status(status: &StatusSnapshot) {
    info!(
        state = %status.run_state,
        progress_percent = status.progress_percent(),
        dispatched = status.numbers_processed,
        submitted = status.submitted,
        cursor = status.cursor,
        ready_workers = status.ready_workers,
        total_workers = status.total_workers,
        "Dispatch status"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
