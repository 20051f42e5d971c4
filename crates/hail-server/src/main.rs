//! # hail-server
//!
//! Dispatch server binary — wires the gateway, registry, and matcher
//! together and starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hail_server::config::ServerConfig;
use hail_server::server::DispatchServer;
use hail_server::session::StaticTokenAuth;
use hail_server::store::MemoryRideStore;

/// Hail dispatch server.
#[derive(Parser, Debug)]
#[command(name = "hail-server", about = "Hail ride dispatch server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "9460")]
    port: u16,

    /// Maximum concurrent connections.
    #[arg(long, default_value = "500")]
    max_connections: usize,

    /// Accepted client auth tokens (repeatable).
    #[arg(long = "auth-token", required = true)]
    auth_tokens: Vec<String>,

    /// Seconds an offer waits for a driver response.
    #[arg(long, default_value = "30")]
    offer_ttl_secs: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_connections: args.max_connections,
        offer_ttl_secs: args.offer_ttl_secs,
        ..ServerConfig::default()
    };

    let metrics_handle =
        hail_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let server = DispatchServer::new(
        config,
        Arc::new(MemoryRideStore::new()),
        Arc::new(StaticTokenAuth::new(args.auth_tokens)),
    )
    .with_metrics(metrics_handle);

    let shutdown = Arc::clone(server.shutdown());
    let gateway = Arc::clone(server.gateway());
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown
                .graceful_shutdown(&gateway.connections, vec![], None)
                .await;
        }
    });

    server.serve().await.context("Server error")?;
    Ok(())
}
