//! Local cursor persistence — the agent's previous-state map `P`.
//!
//! Written atomically (temp-file then rename) after every tick so a
//! crash between writes never leaves a half-written file behind. On
//! corrupt or missing state the agent just starts from an empty map;
//! the manager's snapshot convergence absorbs the extra start events.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vmtrack_hypervisor::VmState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalState {
    pub last_update: DateTime<Utc>,
    pub node: String,
    pub vm_states: HashMap<String, VmState>,
}

impl LocalState {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            last_update: Utc::now(),
            node: node.into(),
            vm_states: HashMap::new(),
        }
    }

    /// Load the state file, returning an empty state for this node on
    /// any read or parse failure — never fatal.
    pub fn load(path: &Path, node: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<LocalState>(&content) {
                Ok(state) => {
                    debug!(path = %path.display(), vms = state.vm_states.len(), "loaded local state");
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "local state file is corrupt, starting empty");
                    LocalState::new(node)
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no local state file, starting empty");
                LocalState::new(node)
            }
        }
    }

    /// Persist via temp-file + rename so a concurrent reader (or a
    /// crash mid-write) never observes a partial file.
    pub fn save_atomic(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_shim::TempDir;
    use vmtrack_hypervisor::{VmKind, VmStatus};

    mod tempfile_shim {
        use std::path::PathBuf;

        /// Minimal scratch-directory helper so tests don't depend on the
        /// `tempfile` crate for a single throwaway directory per test.
        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new() -> std::io::Result<Self> {
                let dir = std::env::temp_dir().join(format!(
                    "vmtrack-agent-test-{}-{}",
                    std::process::id(),
                    uuid::Uuid::new_v4()
                ));
                std::fs::create_dir_all(&dir)?;
                Ok(Self(dir))
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn missing_file_yields_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let state = LocalState::load(&path, "pve1");
        assert!(state.vm_states.is_empty());
        assert_eq!(state.node, "pve1");
    }

    #[test]
    fn corrupt_file_yields_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not valid json").unwrap();
        let state = LocalState::load(&path, "pve1");
        assert!(state.vm_states.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut state = LocalState::new("pve1");
        state.vm_states.insert(
            "100".to_string(),
            VmState {
                node: "pve1".to_string(),
                vm_id: "100".to_string(),
                kind: VmKind::FullVm,
                name: Some("web-01".to_string()),
                status: VmStatus::Running,
                uptime_seconds: 3600,
            },
        );
        state.save_atomic(&path).unwrap();

        let loaded = LocalState::load(&path, "pve1");
        assert_eq!(loaded.vm_states.len(), 1);
        assert_eq!(loaded.vm_states["100"].status, VmStatus::Running);

        // temp file must not be left behind
        assert!(!path.with_extension("json.tmp").exists());
    }
}
