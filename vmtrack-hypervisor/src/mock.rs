//! Mock hypervisor probe for testing and `--dev` runs.

use async_trait::async_trait;
use std::sync::RwLock;

use crate::error::Result;
use crate::traits::HypervisorProbe;
use crate::types::{VmKind, VmState};

/// In-memory probe whose VM inventory is set directly by the caller.
///
/// Tests drive the agent state engine by calling [`MockProbe::set_vms`]
/// between ticks and asserting on the start/stop events the engine
/// emits — there is no real hypervisor underneath.
pub struct MockProbe {
    vms: RwLock<Vec<VmState>>,
    fail_next: RwLock<bool>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self {
            vms: RwLock::new(Vec::new()),
            fail_next: RwLock::new(false),
        }
    }

    /// Replace the full VM inventory returned by the next `list_vms` call.
    pub fn set_vms(&self, vms: Vec<VmState>) {
        *self.vms.write().unwrap() = vms;
    }

    /// Make the next `list_vms` call return a transport error, simulating
    /// a probe failure the agent must survive (spec §4.2 step 1).
    pub fn fail_next_call(&self) {
        *self.fail_next.write().unwrap() = true;
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorProbe for MockProbe {
    async fn list_vms(&self, include_full_vm: bool, include_container: bool) -> Result<Vec<VmState>> {
        if std::mem::take(&mut *self.fail_next.write().unwrap()) {
            return Err(crate::error::ProbeError::Transport("mock probe failure".into()));
        }

        let vms = self.vms.read().unwrap();
        Ok(vms
            .iter()
            .filter(|v| match v.kind {
                VmKind::FullVm => include_full_vm,
                VmKind::Container => include_container,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VmStatus;

    fn vm(id: &str, kind: VmKind, status: VmStatus) -> VmState {
        VmState {
            node: "pve1".into(),
            vm_id: id.into(),
            kind,
            name: Some(id.into()),
            status,
            uptime_seconds: 0,
        }
    }

    #[tokio::test]
    async fn filters_by_kind() {
        let probe = MockProbe::new();
        probe.set_vms(vec![
            vm("100", VmKind::FullVm, VmStatus::Running),
            vm("200", VmKind::Container, VmStatus::Running),
        ]);

        let only_vms = probe.list_vms(true, false).await.unwrap();
        assert_eq!(only_vms.len(), 1);
        assert_eq!(only_vms[0].vm_id, "100");
    }

    #[tokio::test]
    async fn fail_next_call_returns_error_once() {
        let probe = MockProbe::new();
        probe.fail_next_call();
        assert!(probe.list_vms(true, true).await.is_err());
        assert!(probe.list_vms(true, true).await.is_ok());
    }
}
