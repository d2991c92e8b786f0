//! Location Logger CLI
//!
//! Runs the adaptive GPS/network acquisition loop in the background and mails
//! exports of the recorded track.

use clap::{Parser, Subcommand};
use geotrail::{
    config::Config,
    delivery::{self, DeliveryOutcome, SmtpMailer},
    export::{ExportBundle, ExportError, Selection},
    ledger::Ledger,
    provider::CommandProvider,
    supervisor::{
        shutdown_signal, InstanceLock, StartOutcome, StopOutcome, Supervisor, SupervisorError,
    },
    tracker::Tracker,
    types::TIMESTAMP_FORMAT,
    wakelock::WakeLock,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "geotrail")]
#[command(about = "Battery-aware GPS/network location logger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory (ledger, pid file, daemon log)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start logging in the background
    Start,

    /// Stop the background logger
    Stop,

    /// Show whether the background logger is running
    Status,

    /// Run the acquisition loop in the foreground
    Run,

    /// Export a time range (or `all`) and mail it
    Send {
        /// Range start ("2025-11-26", "2025-11-26 09:00") or `all`
        start: String,

        /// Range end, same formats as start
        end: Option<String>,
    },

    /// Show ledger statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }

    match &cli.command {
        Commands::Start => start(&cli, &config)?,
        Commands::Stop => stop(&config)?,
        Commands::Status => status(&config)?,
        Commands::Run => run_tracker(&config).await?,
        Commands::Send { start, end } => send(&config, start, end.as_deref()).await?,
        Commands::Stats => show_stats(&config)?,
    }

    Ok(())
}

fn supervisor(cli: Option<&Cli>, config: &Config) -> Result<Supervisor, Box<dyn std::error::Error>> {
    let mut args = vec!["run".to_string()];
    if let Some(cli) = cli {
        if let Some(path) = &cli.config {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("--log-level".to_string());
        args.push(cli.log_level.clone());
    }
    args.push("--data-dir".to_string());
    args.push(config.storage.data_dir.display().to_string());

    Ok(Supervisor::new(
        config.storage.pid_path(),
        config.storage.daemon_log_path(),
        std::env::current_exe()?,
        args,
    ))
}

fn start(cli: &Cli, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match supervisor(Some(cli), config)?.start()? {
        StartOutcome::AlreadyRunning { pid } => {
            println!("Already running (pid {pid})");
        }
        StartOutcome::Started { pid } => {
            println!("Started location logging in the background (pid {pid})");
            println!("Ledger: {}", config.storage.ledger_path().display());
            println!("Log: {}", config.storage.daemon_log_path().display());
        }
    }
    Ok(())
}

fn stop(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match supervisor(None, config)?.stop()? {
        StopOutcome::Stopped { pid } => println!("Stopped location logging (pid {pid})"),
        StopOutcome::NotRunning => println!("Location logging is not running"),
    }
    Ok(())
}

fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    match supervisor(None, config)?.status()? {
        Some(pid) => println!("Running (pid {pid})"),
        None => println!("Not running"),
    }
    Ok(())
}

async fn run_tracker(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let tracker_config = config.tracker.to_tracker_config()?;

    // Guards drop in reverse order on every exit path: wake lock first, then the instance lock.
    let _instance = match InstanceLock::acquire(config.storage.pid_path()) {
        Ok(lock) => lock,
        Err(SupervisorError::AlreadyRunning(pid)) => {
            println!("Already running (pid {pid})");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let _wake_lock = WakeLock::acquire(&config.wake_lock.to_wake_lock_config())?;

    let provider = CommandProvider::new(config.provider.to_provider_config());
    let ledger = Ledger::new(config.storage.ledger_path());
    let mut tracker = Tracker::new(provider, ledger, tracker_config);
    let stats = tracker.stats();

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = tracker.run() => {
            if let Err(e) = &result {
                tracing::error!("Tracker error: {}", e);
            }
            result.map_err(Into::into)
        }
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => {
                    tracing::info!("Received {}, shutting down...", name);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    let s = stats.snapshot();
    tracing::info!("Final statistics:");
    tracing::info!("  Ticks: {}", s.ticks);
    tracing::info!("  Fixes written: {}", s.fixes_written);
    tracing::info!("  GPS fixes: {}", s.gps_fixes);
    tracing::info!("  Network fixes: {}", s.network_fixes);
    tracing::info!("  Acquisition failures: {}", s.acquire_failures);
    tracing::info!("  Ledger write failures: {}", s.persist_failures);

    result
}

async fn send(
    config: &Config,
    start: &str,
    end: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let selection = match (start, end) {
        ("all", None) => Selection::All,
        (start, Some(end)) => Selection::parse_range(start, end)?,
        (_, None) => {
            println!("Give both a start and an end, or `all`");
            println!("  geotrail send \"2025-11-26 09:00\" \"2025-11-26 18:00\"");
            return Ok(());
        }
    };

    let ledger = Ledger::new(config.storage.ledger_path());
    let bundle = match ExportBundle::create(&ledger, selection, &config.storage.export_dir()) {
        Ok(bundle) => bundle,
        Err(ExportError::Empty(selection)) => {
            println!("No fixes recorded for {selection}, nothing to send");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("Exporting {} fixes for {}", bundle.fix_count, selection);

    let mailer = SmtpMailer::new(config.delivery.timeout());
    let outcome = delivery::send(
        &mailer,
        &bundle.files(),
        &config.delivery.accounts,
        &selection.to_string(),
    )
    .await;

    match outcome {
        DeliveryOutcome::Delivered { account } => {
            println!("Sent via account [{account}]");
            Ok(())
        }
        DeliveryOutcome::AllFailed { attempted } => {
            Err(format!("All {attempted} mail accounts failed").into())
        }
        DeliveryOutcome::NoUsableAccount => {
            Err("No mail account has a complete set of credentials".into())
        }
    }
}

fn show_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = Ledger::new(config.storage.ledger_path());
    let stats = ledger.stats()?;

    println!("Ledger Statistics");
    println!("=================");
    println!("File: {}", ledger.path().display());
    println!("Fixes: {}", stats.total_rows);
    println!("Malformed rows: {}", stats.malformed_rows);
    if let (Some(first), Some(last)) = (stats.first, stats.last) {
        println!("First: {}", first.format(TIMESTAMP_FORMAT));
        println!("Last: {}", last.format(TIMESTAMP_FORMAT));
    }
    if !stats.by_provider.is_empty() {
        println!();
        println!("By provider:");
        for (provider, count) in &stats.by_provider {
            println!("  {provider}: {count}");
        }
    }

    Ok(())
}
