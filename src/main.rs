//! ==============================================================================
//! main.rs - m2m edge bridge entry point
//! ==============================================================================
//!
//! purpose:
//!     connects a raspberry pi's sensor and actuator to a oneM2M repository
//!     (Mobius) that only offers "create" and "give me the latest". one
//!     binary, two roles:
//!
//!     - publisher: sample the dht sensor, upload readings to DHT_AE/DATA
//!     - poller:    watch FAN_AE/CMD and switch the output on each new command
//!
//! responsibilities:
//!     - parse the command line and load bridge.toml
//!     - initialize logging
//!     - build the repository client and the role's driver
//!     - run the role's loop until ctrl-c / SIGTERM, then release the driver
//!
//! relationships:
//!     - uses: config.rs, repository.rs, hal.rs, gpio.rs
//!     - runs: publisher.rs (TelemetryPublisher), poller.rs (CommandPoller)
//!
//! architecture:
//!
//!     ┌──────────────────────┐                ┌──────────────────────┐
//!     │  publisher process   │                │    poller process    │
//!     │  dht -> validate     │                │  la -> dedup(ri)     │
//!     │       -> POST cin    │                │     -> decode -> led │
//!     └──────────┬───────────┘                └──────────▲───────────┘
//!                │ http (5s)                              │ http (0.5s)
//!                ▼                                        │
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                  Mobius CSE (DATA, CMD)                     │
//!     └─────────────────────────────────────────────────────────────┘
//!
//!     the two roles share nothing in-process; they only meet in the repository.
//!
//! ==============================================================================

mod config;
mod domain;
mod gpio;
mod hal;
mod poller;
mod publisher;
mod repository;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{BridgeConfig, Role};
use poller::CommandPoller;
use publisher::TelemetryPublisher;
use repository::HttpRepository;

/// Bridge a DHT sensor and a GPIO output to a oneM2M repository.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Config file (default: config/bridge.toml, then ../config/bridge.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Role to run; overrides `role` in the config file
    #[command(subcommand)]
    role: Option<Role>,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // step 1: load configuration
    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::load_or_default(),
    };
    let role = cli.role.unwrap_or(config.role);

    // step 2: logging, RUST_LOG wins over the config level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    config.print_summary(role);

    // step 3: run the role until shutdown
    match role {
        Role::Publisher => run_publisher(&config).await,
        Role::Poller => run_poller(&config).await,
    }
}

async fn run_publisher(config: &BridgeConfig) -> Result<()> {
    let repository = HttpRepository::new(
        &config.repository.base_url,
        &config.publisher.originator,
        &config.repository.release_version,
        config.publisher.request_timeout(),
    )?;
    let sensor = hal::open_sensor(&config.publisher.sensor);
    let mut publisher = TelemetryPublisher::new(
        repository,
        sensor,
        &config.publisher,
        config.logging.show_sensor_data,
    );

    info!("[*] DHT -> Mobius uploader ({})", config.publisher.container_path().url(&config.repository.base_url));
    tokio::select! {
        _ = publisher.run() => {}
        _ = shutdown_signal() => info!("Shutting down publisher"),
    }

    // the sensor is released whichever state the loop was in
    publisher.release().await;
    Ok(())
}

async fn run_poller(config: &BridgeConfig) -> Result<()> {
    let repository = HttpRepository::new(
        &config.repository.base_url,
        &config.poller.originator,
        &config.repository.release_version,
        config.poller.request_timeout(),
    )?;
    let actuator = hal::Led::new(&config.poller.actuator).context("failed to open actuator")?;
    let mut poller = CommandPoller::new(repository, Box::new(actuator), &config.poller)?;

    info!("[*] Mobius -> actuator control ({})", config.poller.container_path().latest_url(&config.repository.base_url));
    tokio::select! {
        _ = poller.run() => {}
        _ = shutdown_signal() => info!("Shutting down poller"),
    }
    Ok(())
}

/// resolves on ctrl-c, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
