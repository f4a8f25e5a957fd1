//! Ingest Reconciler (C4) — the core of the system.
//!
//! Applies single start/stop events and full snapshots to the session
//! log under the single-open-session invariant, serialized per node so
//! two concurrent calls touching the same `(node, vm_id)` can never both
//! observe "no open session" and both insert.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, warn};

use vmtrack_common::log_session;

use crate::force_sync::ForceSyncRegistry;
use crate::store::{Session, SessionStore, StoreError, VmKind, VmStatus};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A completed VM state observation, as handed to `vm_states`.
pub struct ObservedVm {
    pub vm_id: String,
    pub kind: VmKind,
    pub name: Option<String>,
    pub status: VmStatus,
    pub uptime_seconds: u64,
}

pub struct VmStatesOutcome {
    pub vms_processed: usize,
    pub sessions_started: usize,
    pub sessions_stopped: usize,
}

/// Per-node mutexes, created lazily. This is the only coordination
/// primitive beyond the store's own operations — no suspension happens
/// while one of these is held except for store calls that are part of
/// the current ingest.
#[derive(Default)]
struct NodeLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    fn get(&self, node: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    force_sync: Arc<ForceSyncRegistry>,
    node_locks: NodeLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SessionStore>, force_sync: Arc<ForceSyncRegistry>) -> Self {
        Self {
            store,
            force_sync,
            node_locks: NodeLocks::default(),
        }
    }

    pub async fn register_node(&self, name: &str, hostname: Option<String>) -> crate::store::Node {
        self.store.register_node(name, hostname).await
    }

    pub async fn vm_start(
        &self,
        node: &str,
        vm_id: &str,
        name: Option<String>,
        kind: VmKind,
        start_time: DateTime<Utc>,
    ) -> Result<Session, ReconcileError> {
        let lock = self.node_locks.get(node);
        let _guard = lock.lock().await;

        self.store.bump_node_event(node, Utc::now()).await;
        self.store
            .upsert_tracked_vm(node, vm_id, name, kind, VmStatus::Running, Utc::now())
            .await;

        let session = match self.store.open_session(node, vm_id, kind, start_time).await {
            Ok(session) => session,
            Err(StoreError::AlreadyOpen { existing, .. }) => {
                if start_time < existing.start_time {
                    self.store.widen_start(&existing.id, start_time).await?
                } else {
                    *existing
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.check_invariant(node, vm_id).await;
        log_session!("start", node, vm_id, "session {} open since {}", session.id, session.start_time);
        Ok(session)
    }

    pub async fn vm_stop(
        &self,
        node: &str,
        vm_id: &str,
        stop_time: DateTime<Utc>,
    ) -> Result<Option<Session>, ReconcileError> {
        let lock = self.node_locks.get(node);
        let _guard = lock.lock().await;

        self.store.bump_node_event(node, Utc::now()).await;
        self.store
            .upsert_tracked_vm(node, vm_id, None, VmKind::FullVm, VmStatus::Stopped, Utc::now())
            .await;

        let open = match self.store.find_open(node, vm_id).await {
            Some(s) => s,
            None => {
                // A stop without a prior start is benign — it restores
                // convergence rather than indicating an error.
                return Ok(None);
            }
        };

        let closed = self.store.close_session(&open.id, stop_time).await?;
        log_session!(
            "stop",
            node,
            vm_id,
            "session {} closed, duration {:?}s",
            closed.id,
            closed.duration_seconds
        );
        Ok(Some(closed))
    }

    /// The authoritative reconciliation path: brings the session log for
    /// `node` into agreement with a full snapshot of VM state.
    pub async fn vm_states(
        &self,
        node: &str,
        snapshot_ts: DateTime<Utc>,
        vms: Vec<ObservedVm>,
    ) -> Result<VmStatesOutcome, ReconcileError> {
        let lock = self.node_locks.get(node);
        let _guard = lock.lock().await;

        self.store.bump_node_event(node, snapshot_ts).await;

        for vm in &vms {
            self.store
                .upsert_tracked_vm(
                    node,
                    &vm.vm_id,
                    vm.name.clone(),
                    vm.kind,
                    vm.status,
                    snapshot_ts,
                )
                .await;
        }

        let open = self.store.open_sessions_for_node(node).await;
        let snapshot_ids: std::collections::HashSet<&str> =
            vms.iter().map(|v| v.vm_id.as_str()).collect();

        let mut started = 0usize;
        let mut stopped = 0usize;

        for vm in &vms {
            if vm.status == VmStatus::Running {
                if !open.contains_key(&vm.vm_id) {
                    let start_time = if vm.uptime_seconds > 0 {
                        snapshot_ts - chrono::Duration::seconds(vm.uptime_seconds as i64)
                    } else {
                        snapshot_ts
                    };
                    match self.store.open_session(node, &vm.vm_id, vm.kind, start_time).await {
                        Ok(_) => started += 1,
                        Err(StoreError::AlreadyOpen { .. }) => {
                            // Another path opened it concurrently within
                            // this same node-locked call — impossible in
                            // practice, but idempotent either way.
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                // Already open: leave it alone.
            } else if let Some(session) = open.get(&vm.vm_id) {
                self.store.close_session(&session.id, snapshot_ts).await?;
                stopped += 1;
            }
        }

        for (vm_id, session) in &open {
            if !snapshot_ids.contains(vm_id.as_str()) {
                self.store.close_session(&session.id, snapshot_ts).await?;
                stopped += 1;
            }
        }

        for vm in &vms {
            self.check_invariant(node, &vm.vm_id).await;
        }

        log_session!(
            "snapshot",
            node,
            "*",
            "{} vms processed, {} started, {} stopped",
            vms.len(),
            started,
            stopped
        );

        Ok(VmStatesOutcome {
            vms_processed: vms.len(),
            sessions_started: started,
            sessions_stopped: stopped,
        })
    }

    /// Request a force-sync for one node (or every node, if `target` is
    /// `None`). Returns the count of nodes notified.
    pub fn request_force_sync(&self, target: Option<&str>, known_nodes: &[String]) -> usize {
        self.force_sync.request(target, known_nodes)
    }

    /// Called from the heartbeat path — returns `true` (and clears the
    /// flag) if this node has a pending force-sync request.
    pub fn drain_force_sync(&self, node: &str) -> bool {
        self.force_sync.drain(node)
    }

    /// Post-ingest diagnostic: if more than one open session somehow
    /// exists for `(node, vm_id)`, close every session but the most
    /// recently created one at `now`, and log at error. Recoverable,
    /// not fatal — a healthy store never triggers this.
    async fn check_invariant(&self, node: &str, vm_id: &str) {
        let mut open = self.store.all_open_for_vm(node, vm_id).await;
        if open.len() <= 1 {
            return;
        }

        error!(node, vm_id, count = open.len(), "invariant violation: multiple open sessions, healing");
        open.sort_by_key(|s| s.created_at);
        let keep = open.pop().expect("len > 1 checked above");
        let now = Utc::now();
        for stale in open {
            if let Err(e) = self.store.close_session(&stale.id, now).await {
                warn!(session_id = %stale.id, error = %e, "failed to close stale duplicate session");
            }
        }
        warn!(node, vm_id, kept_session = %keep.id, "invariant healed, older sessions closed at now");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(ForceSyncRegistry::new()),
        )
    }

    #[tokio::test]
    async fn clean_start_stop_yields_expected_duration() {
        let r = reconciler();
        r.vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();
        let closed = r
            .vm_stop("a", "42", t("2025-01-01T12:30:00Z"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.duration_seconds, Some(9000));
        assert!(!closed.is_running);
    }

    #[tokio::test]
    async fn duplicate_start_is_idempotent() {
        let r = reconciler();
        let s1 = r
            .vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();
        let s2 = r
            .vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();
        assert_eq!(s1.id, s2.id);
        assert_eq!(s2.start_time, t("2025-01-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn backdated_start_widens() {
        let r = reconciler();
        r.vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();
        let s2 = r
            .vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T09:30:00Z"))
            .await
            .unwrap();
        assert_eq!(s2.start_time, t("2025-01-01T09:30:00Z"));
    }

    #[tokio::test]
    async fn stop_without_start_is_benign() {
        let r = reconciler();
        let result = r.vm_stop("a", "99", t("2025-01-01T10:00:00Z")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missed_stop_heals_via_snapshot() {
        let r = reconciler();
        r.vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();

        let outcome = r
            .vm_states(
                "a",
                t("2025-01-01T13:00:00Z"),
                vec![ObservedVm {
                    vm_id: "42".to_string(),
                    kind: VmKind::FullVm,
                    name: None,
                    status: VmStatus::Stopped,
                    uptime_seconds: 0,
                }],
            )
            .await
            .unwrap();

        assert_eq!(outcome.sessions_stopped, 1);

        let open = r.store.find_open("a", "42").await;
        assert!(open.is_none());
    }

    #[tokio::test]
    async fn snapshot_opens_backdated_session_for_unknown_running_vm() {
        let r = reconciler();
        let outcome = r
            .vm_states(
                "a",
                t("2025-01-01T13:00:00Z"),
                vec![ObservedVm {
                    vm_id: "7".to_string(),
                    kind: VmKind::FullVm,
                    name: None,
                    status: VmStatus::Running,
                    uptime_seconds: 3600,
                }],
            )
            .await
            .unwrap();

        assert_eq!(outcome.sessions_started, 1);
        let open = r.store.find_open("a", "7").await.unwrap();
        assert_eq!(open.start_time, t("2025-01-01T12:00:00Z"));
    }

    #[tokio::test]
    async fn snapshot_closes_vanished_vm() {
        let r = reconciler();
        r.vm_start("a", "42", None, VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();

        let outcome = r.vm_states("a", t("2025-01-01T13:00:00Z"), vec![]).await.unwrap();
        assert_eq!(outcome.sessions_stopped, 1);
        assert!(r.store.find_open("a", "42").await.is_none());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start(i64),
        Stop(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<i64>().prop_map(|offset| Op::Start(offset.rem_euclid(100_000))),
            any::<i64>().prop_map(|offset| Op::Stop(offset.rem_euclid(100_000))),
        ]
    }

    fn epoch_plus(seconds: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    proptest! {
        /// P1: after any sequence of start/stop calls against the same
        /// (node, vm_id), at most one open session ever exists for it.
        #[test]
        fn p1_at_most_one_open_session(ops in prop::collection::vec(op_strategy(), 0..30)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemorySessionStore::new());
                let r = Reconciler::new(store.clone(), Arc::new(ForceSyncRegistry::new()));

                for op in ops {
                    match op {
                        Op::Start(offset) => {
                            let _ = r
                                .vm_start("a", "vm", None, VmKind::FullVm, epoch_plus(offset))
                                .await;
                        }
                        Op::Stop(offset) => {
                            let _ = r.vm_stop("a", "vm", epoch_plus(offset)).await;
                        }
                    }
                    let open = store.all_open_for_vm("a", "vm").await;
                    prop_assert!(open.len() <= 1);
                }
                Ok(())
            })?;
        }

        /// P2: every closed session has a non-negative duration, and the
        /// duration always equals `end_time - start_time` exactly.
        #[test]
        fn p2_duration_is_non_negative_and_exact(
            start_offset in 0i64..50_000,
            stop_offset in 0i64..50_000,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let store = Arc::new(InMemorySessionStore::new());
                let r = Reconciler::new(store, Arc::new(ForceSyncRegistry::new()));

                let start = epoch_plus(start_offset);
                let stop = epoch_plus(stop_offset);

                r.vm_start("a", "vm", None, VmKind::FullVm, start).await.unwrap();
                if let Some(closed) = r.vm_stop("a", "vm", stop).await.unwrap() {
                    let duration = closed.duration_seconds.unwrap();
                    prop_assert!(duration >= 0);
                    prop_assert_eq!(duration, (stop - start).num_seconds().max(0));
                }
                Ok(())
            })?;
        }
    }
}
