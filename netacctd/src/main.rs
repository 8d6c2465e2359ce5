mod capture;
mod control;
mod counter_store;
mod flush;
mod poller;
mod reporter;
mod shutdown;
mod storage;

use anyhow::Result;
use clap::{Parser, Subcommand};
use counter_store::CounterStore;
use netacct_config::Config;
use shutdown::Shutdown;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    version,
    about = "Per-host network traffic accounting daemon",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the accounting daemon (the default)
    Run {
        /// Configuration file to use instead of /etc/netacct.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarize daily logs from a directory
    Report {
        /// Directory holding <YYYY-MM-DD>.bin (or .bin.gz) files
        directory: PathBuf,
        /// Aggregation mode
        #[arg(value_enum)]
        mode: reporter::ReportMode,
    },
}

/// Configure console logging, level taken from RUST_LOG.
fn set_console_logging() -> Result<()> {
    let level = if let Ok(level) = std::env::var("RUST_LOG") {
        match level.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        }
    } else {
        LevelFilter::INFO
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    set_console_logging()?;
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Report { directory, mode }) => reporter::run(&directory, mode),
        Some(Commands::Run { config }) => run_daemon(config),
        None => run_daemon(None),
    }
}

fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    info!("netacct starting for interface {}", config.interface);

    // One store for the whole daemon, handed to every worker.
    let store = Arc::new(CounterStore::new());
    for raw_ip in &config.tracked_ips {
        match raw_ip.parse::<Ipv4Addr>() {
            Ok(ip) => {
                if let Err(e) = store.register(ip) {
                    warn!("Unable to track configured address {ip}: {e}");
                }
            }
            Err(_) => warn!("Ignoring invalid tracked_ips entry: {raw_ip}"),
        }
    }

    std::fs::create_dir_all(Path::new(&config.root_dir).join(&config.interface))?;

    let shutdown = Shutdown::new();
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    // Anything that can fail fails here, before the workers detach:
    // capture open and control socket bind are the daemon's only fatal
    // runtime resources.
    let capture_handle =
        capture::spawn_capture(config.interface.clone(), store.clone(), shutdown.clone())?;
    let control_listener = control::bind_socket(&config.control_socket)?;
    let control_handle =
        control::spawn_control_server(control_listener, store.clone(), stop_rx)?;
    let poller_handle = poller::spawn_poller(&config, store.clone(), shutdown.clone())?;
    let flush_handle = flush::spawn_flush(&config, store.clone(), shutdown.clone())?;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_shutdown = shutdown.clone();
    std::thread::Builder::new()
        .name("Signal Handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                match sig {
                    SIGINT => warn!("Terminating on SIGINT"),
                    SIGTERM => warn!("Terminating on SIGTERM"),
                    _ => warn!("Terminating on signal {sig}"),
                }
                signal_shutdown.signal();
                let _ = stop_tx.send(true);
            }
        })?;

    // The flush worker performs the final drain on its way out.
    let _ = flush_handle.join();
    let _ = poller_handle.join();
    let _ = capture_handle.join();
    let _ = control_handle.join();
    let _ = std::fs::remove_file(&config.control_socket);
    info!("netacct stopped");
    Ok(())
}
