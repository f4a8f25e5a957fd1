//! # vmtrack manager
//!
//! Central service. Receives start/stop events and periodic snapshots
//! from every agent, reconciles them into a session log under a
//! single-open-session invariant, and answers usage queries over that
//! log.
//!
//! ## Usage
//! ```bash
//! vmtrack-manager --config /etc/vmtrack/manager.yaml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod cli;
mod config;
mod force_sync;
mod http;
mod reconciler;
mod store;
mod usage;

use cli::Args;
use config::Config;
use force_sync::ForceSyncRegistry;
use http::AppState;
use reconciler::Reconciler;
use store::InMemorySessionStore;
use usage::UsageCalculator;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vmtrack_common::init_logging(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting vmtrack manager");

    let config = Config::load_from_search_path(args.config.as_deref())?;
    let config = config.with_cli_overrides(&args);

    if config.security.api_key.is_empty() {
        tracing::warn!("no ingest API key configured — every request will be rejected");
    }

    let store = Arc::new(InMemorySessionStore::new());
    let state = Arc::new(AppState {
        reconciler: Reconciler::new(store.clone(), Arc::new(ForceSyncRegistry::new())),
        usage: UsageCalculator::new(store),
        api_key: config.security.api_key.clone(),
        known_nodes: tokio::sync::RwLock::new(vec![]),
    });

    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %config.server.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("manager shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}
