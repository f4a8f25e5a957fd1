//! # vmtrack agent
//!
//! Runs on each hypervisor host. Polls the local hypervisor for VM state,
//! diffs it against the last known state, and reports start/stop events
//! and periodic snapshots to the manager so it can bill for actual
//! VM uptime.
//!
//! ## Usage
//! ```bash
//! vmtrack-agent --config /etc/vmtrack/agent.yaml
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod engine;
mod local_state;
mod transport;

use cli::Args;
use config::Config;
use engine::AgentEngine;
use transport::ManagerClient;
use vmtrack_hypervisor::{HypervisorProbe, MockProbe, ProxmoxProbe};
use vmtrack_wire::RegisterRequest;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vmtrack_common::init_logging(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting vmtrack agent");

    let config = match Config::load_from_search_path(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    let config = config.with_cli_overrides(&args);

    let node_name = config.node.resolve_name();
    info!(node = %node_name, "agent configured");

    let probe: Arc<dyn HypervisorProbe> = if config.proxmox.use_mock {
        info!("using mock hypervisor probe (--dev)");
        Arc::new(MockProbe::new())
    } else {
        match ProxmoxProbe::new(
            &config.proxmox.host,
            config.proxmox.port,
            &config.proxmox.user,
            &config.proxmox.token_name,
            &config.proxmox.token_value,
            config.proxmox.verify_ssl,
            node_name.clone(),
        ) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                error!(error = %e, "failed to build Proxmox probe");
                std::process::exit(1);
            }
        }
    };

    let manager = Arc::new(ManagerClient::new(
        config.manager.url.clone(),
        config.manager.api_key.clone(),
        Duration::from_secs(config.manager.timeout_seconds),
    ));

    manager
        .register_with_retry(&RegisterRequest {
            name: node_name.clone(),
            hostname: hostname::get()
                .ok()
                .map(|h| h.to_string_lossy().to_string()),
        })
        .await;
    info!(node = %node_name, "registered with manager");

    let engine = AgentEngine::new(
        probe,
        manager,
        node_name.clone(),
        config.polling.track_qemu,
        config.polling.track_lxc,
        config.state_file_path(),
        Duration::from_secs(config.polling.interval_seconds),
    );

    if args.once {
        match engine.run_once().await {
            Ok(()) => {
                info!("self-test cycle completed");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "self-test cycle failed");
                std::process::exit(2);
            }
        }
    }

    let engine = Arc::new(engine);
    let shutdown_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_engine.stop();
        }
    });

    engine.run_forever().await;

    info!("agent shut down cleanly");
    Ok(())
}
