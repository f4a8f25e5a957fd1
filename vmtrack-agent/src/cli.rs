//! Command-line argument parsing.

use clap::Parser;

/// vmtrack agent - polls hypervisor VM state and reports sessions to the manager
#[derive(Parser, Debug)]
#[command(name = "vmtrack-agent")]
#[command(about = "vmtrack agent - hypervisor VM uptime tracker")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (search path is used if omitted)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Override the node identifier
    #[arg(long)]
    pub node_name: Option<String>,

    /// Manager base URL to report to
    #[arg(long)]
    pub manager_url: Option<String>,

    /// Override the local state file path
    #[arg(long)]
    pub state_file: Option<String>,

    /// Use the mock hypervisor probe instead of Proxmox
    #[arg(long)]
    pub dev: bool,

    /// Run a single probe/diff/emit cycle and exit (self-test)
    #[arg(long)]
    pub once: bool,
}
