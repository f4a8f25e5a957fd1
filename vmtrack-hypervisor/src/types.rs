//! Type definitions for agent-local VM state.

use serde::{Deserialize, Serialize};

/// What kind of guest this is — a full VM or a system container.
///
/// The system treats both identically except for this tag, which is
/// carried through to the manager for display purposes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmKind {
    FullVm,
    Container,
}

/// Current power state of a guest, as reported by the hypervisor.
///
/// Statuses the hypervisor reports that don't map onto one of the
/// first three values become `Unknown` (spec §4.1, `UnknownStatus`
/// error kind) — this is never an error, just a no-event poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl VmStatus {
    /// Parse a hypervisor-reported status string, defaulting unrecognized
    /// values to `Unknown` rather than failing the whole probe.
    pub fn from_hypervisor_str(s: &str) -> Self {
        match s {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "paused" | "suspended" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        }
    }
}

/// One guest's state as observed by a single poll of the local hypervisor.
///
/// Ephemeral: the agent keeps a map of these keyed by `vm_id`, replaced
/// wholesale on every poll. Nothing here is persisted centrally as
/// history — the manager only ever sees deltas (start/stop events) or
/// full snapshots built from a list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub node: String,
    pub vm_id: String,
    pub kind: VmKind,
    pub name: Option<String>,
    pub status: VmStatus,
    /// Seconds the hypervisor reports the guest has been running.
    /// Zero or meaningless when `status != Running`.
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_status_becomes_unknown() {
        assert_eq!(VmStatus::from_hypervisor_str("zombie"), VmStatus::Unknown);
    }

    #[test]
    fn recognized_statuses_round_trip() {
        assert_eq!(VmStatus::from_hypervisor_str("running"), VmStatus::Running);
        assert_eq!(VmStatus::from_hypervisor_str("stopped"), VmStatus::Stopped);
        assert_eq!(VmStatus::from_hypervisor_str("paused"), VmStatus::Paused);
    }
}
