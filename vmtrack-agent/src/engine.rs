//! Agent State Engine (C2) — diffs hypervisor polls into start/stop events,
//! persists the local cursor, and drives heartbeat + snapshot cadence.
//!
//! The tick loop shape (timer + immediate-trigger select) and the idea of
//! comparing a fresh poll against a cached map to emit change events is
//! the same pattern used for detecting VM changes against a hypervisor
//! backend; here the cached map is the persisted cursor `P` and the
//! comparison result is start/stop events fed to the manager rather than
//! local change notifications.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, warn};

use vmtrack_common::{log_error, log_session};
use vmtrack_hypervisor::{HypervisorProbe, VmState, VmStatus};
use vmtrack_wire::{VmKind as WireVmKind, VmStartRequest, VmStopRequest, VmStatesRequest, WireVmState};

use crate::transport::ManagerClient;

/// Send a full snapshot on the first successful cycle, then every 100th.
const SNAPSHOT_CYCLE_PERIOD: u64 = 100;

pub struct AgentEngine {
    probe: Arc<dyn HypervisorProbe>,
    manager: Arc<ManagerClient>,
    node: String,
    track_qemu: bool,
    track_lxc: bool,
    state_path: PathBuf,
    tick_interval: Duration,
    prev: RwLock<HashMap<String, VmState>>,
    cycle_count: AtomicU64,
    force_sync_pending: AtomicBool,
    shutdown: AtomicBool,
    immediate_tx: mpsc::Sender<()>,
    immediate_rx: RwLock<Option<mpsc::Receiver<()>>>,
}

impl AgentEngine {
    pub fn new(
        probe: Arc<dyn HypervisorProbe>,
        manager: Arc<ManagerClient>,
        node: impl Into<String>,
        track_qemu: bool,
        track_lxc: bool,
        state_path: PathBuf,
        tick_interval: Duration,
    ) -> Self {
        let (immediate_tx, immediate_rx) = mpsc::channel(16);
        let node = node.into();
        let prev = crate::local_state::LocalState::load(&state_path, &node).vm_states;

        Self {
            probe,
            manager,
            node,
            track_qemu,
            track_lxc,
            state_path,
            tick_interval,
            prev: RwLock::new(prev),
            cycle_count: AtomicU64::new(0),
            force_sync_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            immediate_tx,
            immediate_rx: RwLock::new(Some(immediate_rx)),
        }
    }

    /// A sender that, when signalled, triggers an out-of-band tick
    /// (used by a force-sync heartbeat reply).
    pub fn immediate_trigger(&self) -> mpsc::Sender<()> {
        self.immediate_tx.clone()
    }

    /// Request loop exit at the next tick boundary.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// One probe/diff/emit/persist cycle. Used for CLI self-test and the
    /// first tick of `run_forever`. Fails if the hypervisor probe itself
    /// failed — self-test mode (`--once`) exits non-zero on this so a
    /// broken credential or unreachable hypervisor is visible immediately
    /// rather than silently retried forever.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        if self.tick().await {
            Ok(())
        } else {
            anyhow::bail!("hypervisor probe failed, no VM state collected")
        }
    }

    /// Cooperative loop: ticks at `tick_interval`, honors immediate-poll
    /// triggers (from force-sync), and exits cleanly at the next tick
    /// boundary once `stop()` is called.
    pub async fn run_forever(&self) {
        let mut immediate_rx = match self.immediate_rx.write().await.take() {
            Some(rx) => rx,
            None => {
                warn!("AgentEngine::run_forever called more than once");
                return;
            }
        };

        let mut timer = interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        info!("shutdown requested, exiting tick loop");
                        return;
                    }
                    self.tick().await;
                }
                Some(_) = immediate_rx.recv() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!("immediate tick triggered by force-sync");
                    self.tick().await;
                    timer.reset();
                }
            }
        }
    }

    /// Returns whether the hypervisor probe succeeded this tick.
    async fn tick(&self) -> bool {
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst);
        let is_first_cycle = cycle == 0;

        let polled = match self.probe.list_vms(self.track_qemu, self.track_lxc).await {
            Ok(vms) => Some(vms),
            Err(e) => {
                log_error!("agent", e, "hypervisor probe failed, skipping diff this tick");
                None
            }
        };
        let probe_succeeded = polled.is_some();

        if let Some(vms) = polled {
            let new_map: HashMap<String, VmState> =
                vms.into_iter().map(|v| (v.vm_id.clone(), v)).collect();

            self.diff_and_emit(&new_map).await;

            let mut prev = self.prev.write().await;
            *prev = new_map;
            drop(prev);

            if let Err(e) = self.persist_state().await {
                warn!(error = %e, "failed to persist local state");
            }
        }

        let force_sync_from_heartbeat = self.send_heartbeat().await;
        let should_snapshot = force_sync_from_heartbeat
            || is_first_cycle
            || cycle % SNAPSHOT_CYCLE_PERIOD == 0;

        if should_snapshot {
            self.send_snapshot().await;
        }

        probe_succeeded
    }

    /// Compare the fresh poll `N` against the cached map `P`, emitting
    /// start/stop events. `P` itself is replaced by the caller regardless
    /// of whether emission succeeds — an old `P` would just re-emit the
    /// same start forever.
    async fn diff_and_emit(&self, new_map: &HashMap<String, VmState>) {
        let prev = self.prev.read().await;

        for (vm_id, vm) in new_map {
            let prev_status = prev.get(vm_id).map(|p| p.status);
            let became_running = vm.status == VmStatus::Running
                && prev_status != Some(VmStatus::Running);
            let stopped_running = prev_status == Some(VmStatus::Running)
                && vm.status != VmStatus::Running;

            if became_running {
                self.emit_start(vm).await;
            } else if stopped_running {
                self.emit_stop(vm_id).await;
            }
        }

        for (vm_id, old) in prev.iter() {
            if !new_map.contains_key(vm_id) && old.status == VmStatus::Running {
                self.emit_stop(vm_id).await;
            }
        }
    }

    async fn emit_start(&self, vm: &VmState) {
        let start_time = if vm.uptime_seconds > 0 {
            Utc::now() - chrono::Duration::seconds(vm.uptime_seconds as i64)
        } else {
            Utc::now()
        };

        let req = VmStartRequest {
            node: self.node.clone(),
            vm_id: vm.vm_id.clone(),
            vm_name: vm.name.clone(),
            vm_type: to_wire_kind(vm.kind),
            start_time,
        };

        match self.manager.vm_start(&req).await {
            Ok(reply) => {
                log_session!("start", &self.node, &vm.vm_id, "session {} opened", reply.session_id);
            }
            Err(e) => {
                warn!(node = %self.node, vm_id = %vm.vm_id, error = %e, "failed to emit vm_start");
            }
        }
    }

    async fn emit_stop(&self, vm_id: &str) {
        let req = VmStopRequest {
            node: self.node.clone(),
            vm_id: vm_id.to_string(),
            stop_time: Utc::now(),
        };

        match self.manager.vm_stop(&req).await {
            Ok(reply) => {
                log_session!("stop", &self.node, vm_id, "session {:?} closed", reply.session_id);
            }
            Err(e) => {
                warn!(node = %self.node, vm_id = %vm_id, error = %e, "failed to emit vm_stop");
            }
        }
    }

    async fn send_heartbeat(&self) -> bool {
        match self.manager.heartbeat(&self.node).await {
            Ok(reply) => {
                if reply.force_sync {
                    self.force_sync_pending.store(true, Ordering::SeqCst);
                }
                reply.force_sync
            }
            Err(e) => {
                debug!(node = %self.node, error = %e, "heartbeat failed, absorbed by next tick");
                false
            }
        }
    }

    async fn send_snapshot(&self) {
        let prev = self.prev.read().await;
        let vms: Vec<WireVmState> = prev
            .values()
            .map(|v| WireVmState {
                vm_id: v.vm_id.clone(),
                kind: to_wire_kind(v.kind),
                name: v.name.clone(),
                status: to_wire_status(v.status),
                uptime: v.uptime_seconds,
            })
            .collect();
        drop(prev);

        let req = VmStatesRequest {
            node: self.node.clone(),
            timestamp: Utc::now(),
            vms,
        };

        match self.manager.vm_states(&req).await {
            Ok(reply) => {
                self.force_sync_pending.store(false, Ordering::SeqCst);
                info!(
                    node = %self.node,
                    vms_processed = reply.vms_processed,
                    sessions_started = reply.sessions_started,
                    sessions_stopped = reply.sessions_stopped,
                    "snapshot sent"
                );
            }
            Err(e) => {
                warn!(node = %self.node, error = %e, "failed to send snapshot, force-sync flag retained");
            }
        }
    }

    async fn persist_state(&self) -> std::io::Result<()> {
        let prev = self.prev.read().await;
        let mut state = crate::local_state::LocalState::new(self.node.clone());
        state.vm_states = prev.clone();
        drop(prev);
        state.save_atomic(&self.state_path)
    }

    /// Request an out-of-band snapshot send on the next tick, mirroring
    /// what a `force_sync=true` heartbeat reply does.
    pub async fn request_force_sync(&self) {
        let _ = self.immediate_tx.send(()).await;
    }
}

fn to_wire_kind(kind: vmtrack_hypervisor::VmKind) -> WireVmKind {
    match kind {
        vmtrack_hypervisor::VmKind::FullVm => WireVmKind::FullVm,
        vmtrack_hypervisor::VmKind::Container => WireVmKind::Container,
    }
}

fn to_wire_status(status: VmStatus) -> vmtrack_wire::VmStatus {
    match status {
        VmStatus::Running => vmtrack_wire::VmStatus::Running,
        VmStatus::Stopped => vmtrack_wire::VmStatus::Stopped,
        VmStatus::Paused => vmtrack_wire::VmStatus::Paused,
        VmStatus::Unknown => vmtrack_wire::VmStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use vmtrack_hypervisor::{MockProbe, VmKind};

    fn vm(id: &str, status: VmStatus, uptime: u64) -> VmState {
        VmState {
            node: "pve1".into(),
            vm_id: id.into(),
            kind: VmKind::FullVm,
            name: Some(format!("vm-{id}")),
            status,
            uptime_seconds: uptime,
        }
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "vmtrack-engine-test-{}-{}-{}",
            std::process::id(),
            name,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn first_tick_with_no_prior_state_emits_start_for_running_vm() {
        let probe = Arc::new(MockProbe::new());
        probe.set_vms(vec![vm("100", VmStatus::Running, 10)]);

        let manager = Arc::new(ManagerClient::new(
            "http://127.0.0.1:1",
            "test-key",
            Duration::from_millis(50),
        ));

        let path = scratch_path("p1");
        let engine = AgentEngine::new(
            probe,
            manager,
            "pve1",
            true,
            true,
            path.clone(),
            Duration::from_secs(30),
        );

        // Probe + manager calls will fail to connect (port 1 is never
        // listening) but the tick must still complete and persist state.
        engine.run_once().await.unwrap();

        let saved = Path::new(&path).exists();
        assert!(saved, "state file should be written even if manager calls fail");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn transition_to_stopped_is_detected_against_loaded_state() {
        let probe = Arc::new(MockProbe::new());
        let manager = Arc::new(ManagerClient::new(
            "http://127.0.0.1:1",
            "test-key",
            Duration::from_millis(50),
        ));
        let path = scratch_path("p2");

        crate::local_state::LocalState {
            last_update: Utc::now(),
            node: "pve1".to_string(),
            vm_states: HashMap::from([("100".to_string(), vm("100", VmStatus::Running, 0))]),
        }
        .save_atomic(&path)
        .unwrap();

        probe.set_vms(vec![vm("100", VmStatus::Stopped, 0)]);

        let engine = AgentEngine::new(
            probe,
            manager,
            "pve1",
            true,
            true,
            path.clone(),
            Duration::from_secs(30),
        );

        engine.run_once().await.unwrap();

        let reloaded = crate::local_state::LocalState::load(&path, "pve1");
        assert_eq!(reloaded.vm_states["100"].status, VmStatus::Stopped);
        let _ = std::fs::remove_file(&path);
    }
}
