//! Waveline development gateway binary.
//!
//! ```bash
//! # Run on the default address 0.0.0.0:9100
//! cargo run --bin waveline-gateway
//!
//! # Custom address
//! cargo run --bin waveline-gateway -- --bind 127.0.0.1:8080
//!
//! # Or via environment variable
//! GATEWAY_ADDR=127.0.0.1:8080 cargo run --bin waveline-gateway
//! ```

use std::sync::Arc;

use clap::Parser;
use waveline_gateway::config::{GatewayCliArgs, GatewayConfig};
use waveline_gateway::gateway::{self, GatewayState};

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    let config = match GatewayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, history_cap = config.history_cap, "starting waveline gateway");

    let state = Arc::new(GatewayState::with_history_cap(config.history_cap));
    match gateway::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
