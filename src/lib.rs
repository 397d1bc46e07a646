pub mod capture;
pub mod classifier;
pub mod config;
pub mod enforcement;
pub mod processor;
pub mod store;
pub mod tracker;
pub mod types;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capture::{CaptureSource, PacketSniffer};
use classifier::OnnxClassifier;
use config::Config;
use processor::{now_secs, FeatureProcessor, Monitor};
use store::StateStore;

/// Detect video streaming on LAN clients and enforce a streaming time quota
#[derive(Parser, Debug)]
#[command(name = "streamwarden", version)]
pub struct Cli {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture traffic, classify it and enforce the quota
    Monitor {
        /// Network interface, saved capture file, named pipe, or `-` for stdin
        #[arg(short, long)]
        source: String,
    },
    /// Evict idle clients from the state file; a running monitor does this on its own
    Cleanup,
    /// Print the persisted client table
    Status,
    /// List capture devices
    Interfaces,
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Monitor { source } => monitor(config, &source),
        Command::Cleanup => cleanup(&config),
        Command::Status => status(&config),
        Command::Interfaces => interfaces(),
    }
}

fn monitor(config: Config, source: &str) -> Result<()> {
    let source = CaptureSource::resolve(source)?;

    let classifier = OnnxClassifier::load(&config.model_path, config.selected_features.len())
        .context("Failed to start classifier")?;
    info!(model = %config.model_path.display(), "model loaded");

    let monitor = Monitor::new(config.clone(), Box::new(classifier));
    info!(clients = monitor.store().len(), state = %config.state_path.display(), "client state loaded");

    let mut processor = FeatureProcessor::new(config.channel_capacity);
    let sender = processor.get_sender().context("Processor sender already taken")?;

    let mut sniffer = PacketSniffer::new_with_sender(sender);
    sniffer.init_sniffer(&source, &config.capture_filter)?;
    sniffer.start_sniffer()?;

    processor
        .start_processor(
            monitor,
            Duration::from_secs(config.batch_interval_secs),
            Duration::from_secs(config.cleanup_interval_secs),
            config.streaming_threshold,
        )
        .map_err(|e| anyhow::anyhow!("Failed to start processor: {e}"))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("Failed to set Ctrl-C handler")?;
    }

    while sniffer.is_running() && !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    // Stopping capture drops the last sender; the processor flushes and exits.
    sniffer.stop_sniffer();
    processor.wait();
    info!("system stopped");
    Ok(())
}

fn cleanup(config: &Config) -> Result<()> {
    let mut store = StateStore::load(config.state_path.clone());
    let evicted = store
        .cleanup(now_secs(), config.idle_timeout_secs)
        .with_context(|| format!("Failed to save {}", config.state_path.display()))?;
    info!(evicted = evicted.len(), remaining = store.len(), "cleanup finished");
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = StateStore::load(config.state_path.clone());
    println!("{}", serde_json::to_string_pretty(store.clients())?);
    Ok(())
}

fn interfaces() -> Result<()> {
    for iface in capture::list_interfaces()? {
        let state = if iface.is_up { "up" } else { "down" };
        println!("{:<16} {:<5} {}", iface.name, state, iface.description);
    }
    Ok(())
}
