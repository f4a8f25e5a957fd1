//! Command-line argument parsing.

use clap::Parser;

/// vmtrack manager - reconciles agent events and answers usage queries
#[derive(Parser, Debug)]
#[command(name = "vmtrack-manager")]
#[command(about = "vmtrack manager - central session log and usage API")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (search path is used if omitted)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(long)]
    pub listen: Option<String>,

    /// Override the ingest API key
    #[arg(long)]
    pub api_key: Option<String>,
}
