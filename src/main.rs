// weir-driver binary entry point.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

use anyhow::Context as AnyhowContext;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use weir_cluster::remote::RemoteCluster;
use weir_cluster::Client;
use weir_core::breaker::Breaker;
use weir_driver::config::{
    load_persisted_state, persisted_state_path, save_persisted_state, Config, PersistedState,
    DEFAULT_CONFIG_PATH,
};
use weir_driver::{integrations, rack};
use weir_task::{Manager, MultiFactory};

const STOP_COMMAND: &str = "STOP";

#[derive(Parser)]
#[command(name = "weir-driver", about = "Field hardware driver for the Weir cluster")]
struct Cli {
    /// Path to the driver configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Blocks until `STOP` arrives on stdin.
fn input_listener(tx: mpsc::Sender<()>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim() == STOP_COMMAND => {
                let _ = tx.send(());
                return;
            }
            Ok(_) => {}
            Err(_) => return,
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let default_filter = if cfg.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
    info!(config = %cli.config.display(), "starting up");
    info!("{}", weir_rt::capabilities());

    let state_path = persisted_state_path();
    match load_persisted_state(&state_path) {
        Ok(persisted) => {
            if persisted.rack_key != 0 && cfg.rack_key == 0 {
                info!(rack = persisted.rack_key, "using persisted rack key");
                cfg.rack_key = persisted.rack_key;
            }
            if !persisted.cluster_key.is_empty() && cfg.cluster_key.is_empty() {
                cfg.cluster_key = persisted.cluster_key;
            }
        }
        Err(err) => warn!(error = %err, "failed to load persisted state"),
    }

    info!(
        host = %cfg.connection.host,
        port = cfg.connection.port,
        "connecting to cluster"
    );
    let client: Arc<dyn Client> = Arc::new(RemoteCluster::new(cfg.connection.clone()));

    let breaker_config = cfg.retry.breaker();
    let bootstrap_breaker = Breaker::new(breaker_config.clone());
    bootstrap_breaker.start();
    let rack = rack::retrieve_driver_rack(cfg.rack_key, &bootstrap_breaker, &client)
        .map_err(|err| anyhow::anyhow!("failed to retrieve rack metadata: {err}"))?;
    bootstrap_breaker.stop();

    let persisted = PersistedState { rack_key: rack.key, cluster_key: cfg.cluster_key.clone() };
    if let Err(err) = save_persisted_state(&state_path, &persisted) {
        warn!(error = %err, "failed to save persisted state");
    }

    let factories = integrations::build_factories(&cfg, &breaker_config);
    let factory = MultiFactory::new(factories);
    let mut manager = Manager::new(rack, client, factory, breaker_config);

    let (tx, rx) = mpsc::channel();
    let listener = std::thread::spawn(move || input_listener(tx));

    manager
        .start()
        .map_err(|err| anyhow::anyhow!("failed to start task manager: {err}"))?;
    info!("task manager running; send {STOP_COMMAND} on stdin to shut down");

    match rx.recv() {
        Ok(()) => info!("received stop command, shutting down"),
        Err(_) => {
            // Stdin closed (daemonized); run until terminated.
            warn!("stdin closed without a stop command; running until terminated");
            loop {
                std::thread::park();
            }
        }
    }

    if let Err(err) = manager.stop() {
        error!(error = %err, "task manager exited with error");
    }
    let _ = listener.join();
    info!("shutdown complete");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[weir-driver] fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}
