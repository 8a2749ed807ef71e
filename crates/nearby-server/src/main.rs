//! # nearby-server
//!
//! HTTP server for the nearby proximity discovery engine.
//!
//! This binary provides:
//! - REST API for starting, stopping and polling the discovery channels
//! - OpenAPI document at `/api/openapi.json`
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! NEARBY_IDENTITY__SELF_ID=me cargo run --package nearby-server
//!
//! # Production
//! NEARBY_ENV=production ./nearby-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::PathBuf;

use anyhow::Context;
use nearby_core::{default_config_path, Config};
use nearby_server::api::create_router;
use nearby_server::logging;
use nearby_server::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Environment variable overriding the config file location.
const CONFIG_PATH_ENV: &str = "NEARBY_CONFIG";

/// Environment variable selecting production logging.
const ENV_MODE_ENV: &str = "NEARBY_ENV";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var(ENV_MODE_ENV).is_ok_and(|v| v == "production");
    logging::init(is_production)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting nearby-server");

    let config_path = std::env::var_os(CONFIG_PATH_ENV)
        .map_or_else(default_config_path, PathBuf::from);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let addr = (config.server.host.clone(), config.server.port);
    let state = AppState::new(&config).shared();
    let app = create_router(state.clone());

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}:{}", addr.0, addr.1))?;
    info!(address = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.hub.stop_all();
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
