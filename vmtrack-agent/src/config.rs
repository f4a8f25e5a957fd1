//! Configuration management for the agent daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::Args;

/// Main configuration structure, loaded from YAML and overridden by CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub manager: ManagerConfig,
    pub proxmox: ProxmoxConfig,
    pub polling: PollingConfig,
    /// Override for the local state file path; falls back to a per-OS default.
    pub state_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            manager: ManagerConfig::default(),
            proxmox: ProxmoxConfig::default(),
            polling: PollingConfig::default(),
            state_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file at an explicit path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "failed to parse config file")?;

        Ok(config)
    }

    /// Search the standard path — current directory, `/etc/vmtrack/`, then
    /// the binary's own directory — for `vmtrack-agent.yaml`, falling back
    /// to defaults if none is found.
    pub fn load_from_search_path(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let mut candidates = vec![
            PathBuf::from("vmtrack-agent.yaml"),
            PathBuf::from("/etc/vmtrack/agent.yaml"),
        ];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("vmtrack-agent.yaml"));
            }
        }

        for candidate in &candidates {
            if candidate.exists() {
                return Self::load(candidate);
            }
        }

        Ok(Self::default())
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref name) = args.node_name {
            self.node.name = Some(name.clone());
        }

        if let Some(ref manager_url) = args.manager_url {
            self.manager.url = manager_url.clone();
        }

        if let Some(ref state_file) = args.state_file {
            self.state_file = Some(state_file.clone());
        }

        if args.dev {
            self.proxmox.use_mock = true;
        }

        self
    }

    /// Resolve the effective state file path (default
    /// `/var/lib/vmtrack-agent/state.json`).
    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmtrack-agent/state.json"))
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Override the auto-detected node identifier.
    pub name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { name: None }
    }
}

impl NodeConfig {
    /// Resolve the node identifier, detecting the local hostname if unset.
    pub fn resolve_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Manager transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            api_key: String::new(),
            timeout_seconds: 30,
        }
    }
}

/// Proxmox VE hypervisor credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub token_name: String,
    pub token_value: String,
    pub verify_ssl: bool,
    /// Not a wire option — set by `--dev` to swap in the mock probe.
    #[serde(skip)]
    pub use_mock: bool,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8006,
            user: "root@pam".to_string(),
            token_name: String::new(),
            token_value: String::new(),
            verify_ssl: true,
            use_mock: false,
        }
    }
}

/// Polling cadence and VM-kind filtering.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub track_qemu: bool,
    pub track_lxc: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            track_qemu: true,
            track_lxc: true,
        }
    }
}
