//! Core hypervisor probe abstraction.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::VmState;

/// Read-only probe over a single hypervisor host's VM inventory.
///
/// This is the entire C1 contract: one operation, no mutation, no
/// held state. Transport failures are returned to the caller (the
/// agent state engine) rather than retried here — retry policy lives
/// in the transport layer, not the probe.
#[async_trait]
pub trait HypervisorProbe: Send + Sync {
    /// List VMs and/or containers on the local node.
    async fn list_vms(&self, include_full_vm: bool, include_container: bool) -> Result<Vec<VmState>>;
}
