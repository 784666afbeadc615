//! webssh2 server binary
//!
//! Exit codes: 0 on normal shutdown, 1 on unrecoverable startup failure
//! (configuration or bind).

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webssh2::bridge::WsServer;
use webssh2::bus::{EventPriority, GatewayEvent};
use webssh2::{build_gateway, config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // `webssh2 [config.json]`
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);

    let config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let services = match build_gateway(config) {
        Ok(services) => services,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    let listener = match WsServer::bind(&services).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    tokio::select! {
        _ = WsServer::run(listener, services.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // polite teardown: close every live transport, drain the bus
    let _ = services.bus.publish(GatewayEvent::SystemShutdown, EventPriority::Critical);
    services.pool.clear();
    services.bus.flush().await;

    info!("shutdown complete");
    ExitCode::SUCCESS
}
