//! # vmtrack Wire
//!
//! JSON request/reply shapes for the agent/manager ingest API. Plain
//! serde structs — no code generation, no schema registry. The manager
//! and agent both depend on this crate so the two sides can never drift
//! on field names independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of guest, carried on the wire exactly as `vmtrack-hypervisor` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmKind {
    FullVm,
    Container,
}

/// Guest power state, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

/// One guest entry inside a `vm-states` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireVmState {
    pub vm_id: String,
    pub kind: VmKind,
    pub name: Option<String>,
    pub status: VmStatus,
    pub uptime: u64,
}

// ---------------------------------------------------------------------
// POST /api/ingest/register
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub success: bool,
    pub node_id: String,
}

// ---------------------------------------------------------------------
// POST /api/ingest/vm-start
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStartRequest {
    pub node: String,
    pub vm_id: String,
    pub vm_name: Option<String>,
    pub vm_type: VmKind,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStartReply {
    pub success: bool,
    pub session_id: String,
}

// ---------------------------------------------------------------------
// POST /api/ingest/vm-stop
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStopRequest {
    pub node: String,
    pub vm_id: String,
    pub stop_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStopReply {
    pub success: bool,
    /// `None` when the stop had no matching open session — still a success.
    pub session_id: Option<String>,
    pub duration_seconds: Option<i64>,
}

// ---------------------------------------------------------------------
// POST /api/ingest/vm-states
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatesRequest {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub vms: Vec<WireVmState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatesReply {
    pub success: bool,
    pub vms_processed: usize,
    pub sessions_started: usize,
    pub sessions_stopped: usize,
}

// ---------------------------------------------------------------------
// POST /api/ingest/heartbeat
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub success: bool,
    pub server_time: DateTime<Utc>,
    pub force_sync: bool,
}

// ---------------------------------------------------------------------
// POST /api/ingest/force-sync
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceSyncRequest {
    /// `None` or `"*"` requests sync from every node.
    pub target_node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceSyncReply {
    pub success: bool,
    pub nodes_notified: usize,
}

/// Generic reply shape for error responses (non-2xx), so clients can
/// decode a body without guessing which endpoint produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_start_request_round_trips_through_json() {
        let req = VmStartRequest {
            node: "pve1".into(),
            vm_id: "42".into(),
            vm_name: Some("web-01".into()),
            vm_type: VmKind::FullVm,
            start_time: "2025-01-01T10:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: VmStartRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.vm_id, "42");
        assert_eq!(back.vm_type, VmKind::FullVm);
    }

    #[test]
    fn vm_stop_reply_allows_absent_session() {
        let reply = VmStopReply {
            success: true,
            session_id: None,
            duration_seconds: None,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"session_id\":null"));
    }
}
