//! # Telemetry Gateway
//!
//! Relays flight-controller telemetry to a remote dashboard and runs onboard
//! sensor operations on request.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration (first argument, default `config/default.toml`)
//!    - Set up logging
//!    - Bind the flight link and connect to the dashboard
//!
//! 2. **Main Loop**
//!    - Relay telemetry, operation results and control responses
//!    - Handle Ctrl+C for graceful shutdown
//!
//! 3. **Shutdown**
//!    - Stop every running operation
//!    - Disconnect from the dashboard
//!
//! The process exits with an error when the flight link fails permanently or
//! the dashboard stays unreachable past the configured ceiling; an external
//! process manager is expected to restart it.
//!
//! ```bash
//! telemetry-gateway config/field.toml
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use telemetry_gateway::config::Config;
use telemetry_gateway::link::{FlightLink, UdpLink};
use telemetry_gateway::logging;
use telemetry_gateway::operation::{OperationRegistry, OperationSupervisor, OutputSink};
use telemetry_gateway::relay::RelayLoop;
use telemetry_gateway::transport::{Transport, WsTransport};

/// Configuration used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = logging::init(&config.logging);
    info!("Telemetry Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path);

    let registry = OperationRegistry::from_config(&config.operations)?;

    let link: Arc<dyn FlightLink> = Arc::new(UdpLink::bind(&config.link)?);

    let (transport, requests) = WsTransport::new(config.server_url());
    let transport: Arc<dyn Transport> = Arc::new(transport);
    if !transport.connect().await {
        error!("Could not connect to dashboard at {}", config.server.url);
        bail!("Initial dashboard connection failed");
    }

    let (sink, results) = OutputSink::channel();
    let supervisor = Arc::new(OperationSupervisor::new(
        registry,
        Arc::clone(&link),
        sink,
        config.relay.stop_timeout(),
    ));

    let relay = RelayLoop::new(&config, link, transport, supervisor, results, requests);

    info!("Press Ctrl+C to exit");
    relay
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await?;

    info!("Telemetry Gateway stopped");
    Ok(())
}
