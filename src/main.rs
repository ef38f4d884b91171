mod config;
mod control;
mod events;
mod resolver;
mod signals;
mod systemd;
mod watcher;

use clap::Parser;
use config::{OverlapPolicy, PlumberConfig, WatchConfig};
use events::{RecordingSink, TracingSink};
use signals::SignalHandler;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use systemd::Systemd;
use tracing_subscriber::EnvFilter;
use watcher::Watcher;

/// Watches the resident memory of one system service and restarts the
/// service whenever it reaches a limit.
#[derive(Parser, Debug)]
#[command(name = "plumber", version, about)]
pub struct Cli {
    /// The name of the service to monitor (default: CorsairService)
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// The memory limit in kilobytes at which to restart the service (default: 500000)
    #[arg(short = 'm', long = "memlimit", value_name = "KB")]
    memlimit: Option<u64>,

    /// The rate in milliseconds at which to poll the service (default: 600000)
    #[arg(short = 'r', long = "rate", value_name = "MS")]
    rate: Option<u64>,

    /// Config file path (ignored when missing)
    #[arg(short, long, default_value = "plumber.toml")]
    config: PathBuf,

    /// Talk to the per-user service manager
    #[arg(long)]
    user: bool,

    /// Let a new check start while a slow restart is still running
    #[arg(long)]
    allow_overlap: bool,

    /// Try to start the service even when stopping it failed
    #[arg(long)]
    restart_after_stop_failure: bool,

    /// Run a single check and exit
    #[arg(long)]
    once: bool,

    /// Print the resolved configuration as JSON and exit
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (lookups, skipped ticks, systemctl calls)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Merge command-line overrides into the file configuration.
fn apply_overrides(config: &mut PlumberConfig, cli: &Cli) {
    if let Some(ref name) = cli.name {
        config.watch.service = name.clone();
    }
    if let Some(limit) = cli.memlimit {
        config.watch.memory_limit_kb = limit;
    }
    if let Some(rate) = cli.rate {
        config.watch.poll_interval_ms = rate;
    }
    if cli.user {
        config.systemd.user = true;
    }
    if cli.allow_overlap {
        config.watch.overlap = OverlapPolicy::Allow;
    }
    if cli.restart_after_stop_failure {
        config.watch.restart_after_stop_failure = true;
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Run a single check and return its records as summary lines.
///
/// Records go only to the in-memory sink so each one is printed once.
async fn run_once(watch: WatchConfig, backend: Arc<Systemd>) -> Vec<String> {
    let records = Arc::new(RecordingSink::new());
    let watcher = Watcher::new(watch, Arc::clone(&backend), backend, Arc::clone(&records));
    let outcome = watcher.check_once().await;
    tracing::debug!(?outcome, "single check finished");
    records
        .records()
        .into_iter()
        .map(|(severity, message)| format!("{severity:?}: {message}"))
        .collect()
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = PlumberConfig::load(&cli.config)?;
    apply_overrides(&mut config, &cli);
    let watch = config.watch_config()?;

    tracing::info!("memory limit: {}KB", watch.memory_limit_kb());
    tracing::info!("polling rate: {}ms", watch.interval().as_millis());

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let backend = Arc::new(Systemd::new(&config.systemd));

    if cli.once {
        for line in run_once(watch, backend).await {
            println!("{line}");
        }
        return Ok(());
    }

    let mut signals = SignalHandler::install()?;
    let sink = TracingSink::new(watch.service());
    let mut watcher = Watcher::new(watch, Arc::clone(&backend), backend, sink);
    watcher.start().await;

    let received = signals.recv().await;
    tracing::info!(signal = ?received, "shutdown requested");
    watcher.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
