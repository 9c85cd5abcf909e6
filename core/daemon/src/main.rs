//! devpulse daemon entrypoint.
//!
//! Starts every collector against one shared event store, then parks until
//! SIGINT/SIGTERM and stops them in reverse order.

use crossbeam_channel::bounded;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devpulse_protocol::SOCKET_NAME;

mod aggregator;
mod anomaly;
mod collector;
mod config;
mod db;
mod events;
mod ingest;
mod process;
mod sanitizer;

use aggregator::Aggregator;
use anomaly::{create_analyzer, create_notifier, AnomalyMonitor, Escalation};
use collector::{Collector, SIGNAL_CHANNEL_CAPACITY};
use config::ObserverConfig;
use db::Db;
use events::now_secs;
use ingest::{
    create_host_log_collector, CommandReceiver, FileWatcher, GitContextTracker, ProcessSampler,
};

const STATE_DIR: &str = ".devpulse";

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            ObserverConfig::default()
        }
    };

    let state_dir = match state_dir() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve devpulse state directory");
            std::process::exit(1);
        }
    };
    let socket_path = state_dir.join(SOCKET_NAME);
    let db_path = db_path(&config, &state_dir);

    let db = match Db::new(db_path.clone()) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize event store");
            std::process::exit(1);
        }
    };

    let (signal_tx, signal_rx) = bounded(SIGNAL_CHANNEL_CAPACITY);
    let mut running: Vec<Box<dyn Collector>> = Vec::new();

    let git_tracker = GitContextTracker::new(Arc::clone(&db));
    let pwd_sender = git_tracker.pwd_sender();
    start(&mut running, Box::new(git_tracker));

    let mut receiver = CommandReceiver::new(
        socket_path.clone(),
        Arc::clone(&db),
        pwd_sender,
        signal_tx.clone(),
    );
    if let Err(err) = receiver.start() {
        error!(error = %err, path = %socket_path.display(), "Failed to start command receiver");
        stop_all(&mut running);
        std::process::exit(1);
    }
    running.push(Box::new(receiver));

    let roots = if config.collectors.watch_roots.is_empty() {
        ingest::discovery::discover_roots(&db, now_secs())
    } else {
        config.collectors.watch_roots.clone()
    };
    if roots.is_empty() {
        info!("File watching idle: no roots configured or discovered");
    } else {
        start(
            &mut running,
            Box::new(FileWatcher::new(
                roots,
                config.normalized_extensions(),
                Arc::clone(&db),
                signal_tx.clone(),
            )),
        );
    }

    start(
        &mut running,
        create_host_log_collector(&config.host_log, Arc::clone(&db), signal_tx.clone()),
    );
    start(
        &mut running,
        Box::new(ProcessSampler::new(
            Duration::from_secs(config.collectors.process_sample_interval_secs),
            Arc::clone(&db),
        )),
    );
    start(
        &mut running,
        Box::new(Aggregator::new(
            Duration::from_secs(config.scheduler.aggregation_interval_secs),
            config.general.retention_days,
            Arc::clone(&db),
        )),
    );

    let escalation = Escalation {
        db: Arc::clone(&db),
        analyzer: create_analyzer(&config.analysis),
        notifier: create_notifier(&config.notifications),
    };
    start(
        &mut running,
        Box::new(AnomalyMonitor::new(
            Duration::from_secs(config.scheduler.anomaly_check_interval_secs),
            signal_rx,
            escalation,
        )),
    );
    // Collectors hold their own clones.
    drop(signal_tx);

    info!(
        socket = %socket_path.display(),
        db = %db_path.display(),
        collectors = running.len(),
        "devpulse daemon started"
    );

    let (stop_tx, stop_rx) = bounded::<()>(1);
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!(error = %err, "Failed to install signal handler");
        stop_all(&mut running);
        std::process::exit(1);
    }

    let _ = stop_rx.recv();
    info!("Shutdown requested");
    stop_all(&mut running);
    info!("devpulse daemon stopped");
}

/// A collector that fails to start is logged and skipped; the daemon keeps
/// running with the rest.
fn start(running: &mut Vec<Box<dyn Collector>>, mut collector: Box<dyn Collector>) {
    match collector.start() {
        Ok(()) => {
            info!(collector = collector.name(), "Collector started");
            running.push(collector);
        }
        Err(err) => warn!(collector = collector.name(), error = %err, "Collector failed to start"),
    }
}

fn stop_all(running: &mut Vec<Box<dyn Collector>>) {
    while let Some(mut collector) = running.pop() {
        collector.stop();
        info!(collector = collector.name(), "Collector stopped");
    }
}

fn init_logging() {
    let debug_enabled = env::var("DEVPULSE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(STATE_DIR))
}

fn db_path(config: &ObserverConfig, state_dir: &std::path::Path) -> PathBuf {
    match &config.general.data_dir {
        Some(dir) => dir.join("events.db"),
        None => state_dir.join("daemon").join("events.db"),
    }
}
