//! `matchsync-gateway`: the development gateway as a standalone server.
//!
//! ```bash
//! cargo run --bin matchsync-gateway -- --bind 0.0.0.0:9300
//! GATEWAY_ADDR=0.0.0.0:9300 cargo run --bin matchsync-gateway -- --no-confirmations
//! ```

use std::sync::Arc;

use clap::Parser;
use matchsync_gateway::config::GatewayArgs;
use matchsync_gateway::gateway::{self, GatewayState};

#[tokio::main]
async fn main() {
    let args = GatewayArgs::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "unusable gateway settings");
            std::process::exit(2);
        }
    };

    let state = Arc::new(GatewayState::from_config(&config));
    let (addr, server) = match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "cannot bind gateway");
            std::process::exit(1);
        }
    };
    tracing::info!(
        %addr,
        max_page_size = config.max_page_size,
        confirmations = config.confirmations,
        "gateway listening"
    );

    if let Err(e) = server.await {
        tracing::error!(error = %e, "gateway server task failed");
    }
}
