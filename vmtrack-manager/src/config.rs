//! Configuration management for the manager daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::Args;

/// Main configuration structure, loaded from YAML and overridden by CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
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
    /// the binary's own directory — for `vmtrack-manager.yaml`, falling back
    /// to defaults if none is found.
    pub fn load_from_search_path(explicit: Option<&str>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let mut candidates = vec![
            PathBuf::from("vmtrack-manager.yaml"),
            PathBuf::from("/etc/vmtrack/manager.yaml"),
        ];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("vmtrack-manager.yaml"));
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
        if let Some(ref listen) = args.listen {
            self.server.listen = listen.clone();
        }

        if let Some(ref api_key) = args.api_key {
            self.security.api_key = api_key.clone();
        }

        self
    }
}

/// HTTP server bind address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Relational store connection. The store itself is an in-memory
/// stand-in today; these fields describe the contract a real backing
/// database would be configured with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/vmtrack".to_string(),
            max_connections: 10,
        }
    }
}

/// Ingest API authentication.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
        }
    }
}
