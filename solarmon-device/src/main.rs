// SolarMon Device - Host build of the device firmware
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # SolarMon Device
//!
//! Runs the device agent on a host: directory-backed storage, a TCP (or TLS)
//! MQTT session, a simulated charge controller and a local parameter portal.
//!
//! ## Usage
//!
//! ```bash
//! # First run writes the default configuration to ./solarmon-data
//! solarmon-device --simulate
//!
//! # Point the device at a broker through the portal
//! curl -X POST -d broker.example.org http://localhost:8080/params/mqttHost
//! ```

mod host;
mod portal;
mod sim;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use solarmon::broker::tcp::TcpConnector;
use solarmon::{Agent, AgentConfig, ConfigStore, FsStore, InboundHandler, LogLevel, TelemetryCollector};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use host::{HostLink, ProcessRestarter};
use sim::SimulatedController;

/// SolarMon device
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the configuration and trust material
    #[arg(short, long, default_value = "./solarmon-data")]
    data_dir: PathBuf,

    /// Port of the local parameter portal
    #[arg(short, long, default_value = "8080")]
    portal_port: u16,

    /// Log level (trace, debug, info, warn, error); defaults to the stored logLevel
    #[arg(long)]
    log_level: Option<String>,

    /// First component of the broker client identifier
    #[arg(long, default_value = "solarmon")]
    app_name: String,

    /// Publish readings from a simulated charge controller
    #[arg(long)]
    simulate: bool,

    /// Reset reason reported on start-up
    #[arg(long, default_value = "power on")]
    reset_reason: String,
}

/// Start-up failures
#[derive(Debug, Error)]
enum DeviceError {
    #[error("Storage error: {0}")]
    Store(#[from] solarmon::StoreError),

    #[error("{0}")]
    Agent(#[from] solarmon::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn level_of(name: &str, fallback: LogLevel) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => level_of(fallback.as_str(), LogLevel::Info),
    }
}

#[tokio::main]
async fn main() -> Result<(), DeviceError> {
    let args = Args::parse();

    let backend = Arc::new(FsStore::open(&args.data_dir)?);
    let link = Arc::new(HostLink::open(backend.clone())?);
    let restarter = Arc::new(ProcessRestarter::new());
    let mut config = AgentConfig::default();
    config.session.app_name = args.app_name.clone();
    let tick = config.session.tick;
    let agent = Arc::new(Agent::new(
        ConfigStore::new(backend),
        Arc::new(TcpConnector::new()),
        link,
        restarter,
        config,
    )?);

    // Initialize tracing
    let stored = agent.live().read(|c| c.log_level());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level_of(args.log_level.as_deref().unwrap_or(stored.as_str()), stored);
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("SolarMon device v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", args.data_dir.display());
    for (label, value) in agent.registry().render_all(&agent.live().snapshot()) {
        info!("  {}: {}", label, value);
    }
    agent.announce_start(&args.reset_reason);

    // Session and telemetry loop
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let agent = Arc::clone(&agent);
        let stop = Arc::clone(&stop);
        let simulate = args.simulate;
        thread::Builder::new()
            .name("session".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut session = agent.session(start);
                let mut collector =
                    simulate.then(|| TelemetryCollector::new(SimulatedController::new(), start));
                let handler: &dyn InboundHandler = &*agent;
                while !stop.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    session.step(now, handler);
                    if let Some(collector) = collector.as_mut() {
                        agent.collect(collector, now);
                    }
                    thread::sleep(tick);
                }
                session.disconnect();
                agent.wait_idle();
            })?
    };

    // Local portal
    let app = portal::router(Arc::clone(&agent));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.portal_port));
    info!("Parameter portal on http://{}/params", addr);
    let listener = TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not listen for shutdown signal: {}", e);
            }
        })
        .await;

    info!("Shutting down");
    stop.store(true, Ordering::Relaxed);
    if worker.join().is_err() {
        error!("Session thread panicked");
    }
    served?;
    Ok(())
}
