//! Session Store (C5).
//!
//! Holds Node, TrackedVm, Session and Rental rows. The row shapes here
//! are deliberately `FromRow`-like (plain fields, no hidden state) so a
//! real relational backing store could be swapped in behind the same
//! [`SessionStore`] trait without reshaping callers — but the
//! implementation underneath is in-memory, matching the "relational
//! store" external collaborator being a contract, not something this
//! repo provisions.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmKind {
    FullVm,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Hourly,
    Weekly,
    Monthly,
}

/// One continuous interval during which a VM was running, as known to
/// the manager. Never hard-deleted during normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub node: String,
    pub vm_id: String,
    pub kind: VmKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub is_running: bool,
    pub start_correlator: Option<String>,
    pub stop_correlator: Option<String>,
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Current-state mirror, one row per `(node, vm_id)`. Authoritative only
/// for "last known status," never for billable duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedVm {
    pub node: String,
    pub vm_id: String,
    pub name: Option<String>,
    pub kind: VmKind,
    pub current_status: VmStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub hostname: Option<String>,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub total_events: u64,
    pub total_vms: u64,
}

/// Billing configuration attached to a `(node?, vm_id)` pair. Independent
/// of Session rows; scoped and priced by the usage calculator only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rental {
    pub id: String,
    pub node: Option<String>,
    pub vm_id: String,
    pub customer: Option<String>,
    pub rental_start: DateTime<Utc>,
    pub rental_end: Option<DateTime<Utc>>,
    pub billing_cycle: BillingCycle,
    pub rate: Option<f64>,
    pub is_active: bool,
    pub notes: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Unique-constraint violation on `(node, vm_id, is_running=true)`.
    /// The reconciler treats this as "already open" and returns the
    /// existing session.
    #[error("a session is already open for {node}/{vm_id}")]
    AlreadyOpen { node: String, vm_id: String, existing: Box<Session> },

    #[error("no session with id {0}")]
    NotFound(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn register_node(&self, name: &str, hostname: Option<String>) -> Node;

    async fn bump_node_event(&self, name: &str, at: DateTime<Utc>);

    async fn find_open(&self, node: &str, vm_id: &str) -> Option<Session>;

    /// Opens a new session. Fails with `AlreadyOpen` if one exists —
    /// callers treat that as a no-op and keep the existing session.
    async fn open_session(
        &self,
        node: &str,
        vm_id: &str,
        kind: VmKind,
        start_time: DateTime<Utc>,
    ) -> Result<Session, StoreError>;

    /// Widen an open session's `start_time` to an earlier value. No-op
    /// (returns the session unchanged) if `new_start >= session.start_time`.
    async fn widen_start(&self, session_id: &str, new_start: DateTime<Utc>) -> Result<Session, StoreError>;

    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<Session, StoreError>;

    async fn upsert_tracked_vm(
        &self,
        node: &str,
        vm_id: &str,
        name: Option<String>,
        kind: VmKind,
        status: VmStatus,
        last_seen: DateTime<Utc>,
    );

    /// All currently-open sessions for `node`, keyed by `vm_id` — the
    /// set `O` referenced by the snapshot reconciliation algorithm.
    async fn open_sessions_for_node(&self, node: &str) -> HashMap<String, Session>;

    /// Every session whose `[start_time, end_time ∨ now)` intersects
    /// `[t0, t1]`, optionally scoped to one node.
    async fn sessions_overlapping(
        &self,
        vm_id: &str,
        node: Option<&str>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Vec<Session>;

    async fn find_rental(&self, node: Option<&str>, vm_id: &str) -> Option<Rental>;

    async fn upsert_rental(&self, rental: Rental);

    /// All open sessions for `(node, vm_id)`, not just one — used only to
    /// verify the single-open-session invariant post-ingest; a healthy
    /// store never returns more than one element here.
    async fn all_open_for_vm(&self, node: &str, vm_id: &str) -> Vec<Session>;
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    tracked_vms: HashMap<(String, String), TrackedVm>,
    nodes: HashMap<String, Node>,
    rentals: HashMap<String, Rental>,
}

/// In-memory implementation of [`SessionStore`]. Adequate for the scope
/// here since the relational store itself is an external contract; swap
/// this out for a real database-backed implementation behind the same
/// trait when persistence across restarts is required.
pub struct InMemorySessionStore {
    inner: RwLock<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn recompute_duration(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        (end - start).num_seconds().max(0)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn register_node(&self, name: &str, hostname: Option<String>) -> Node {
        let mut inner = self.inner.write().unwrap();
        let now = Utc::now();
        let node = inner.nodes.entry(name.to_string()).or_insert_with(|| Node {
            name: name.to_string(),
            hostname: hostname.clone(),
            is_active: true,
            last_seen: now,
            last_event_time: None,
            total_events: 0,
            total_vms: 0,
        });
        node.is_active = true;
        node.last_seen = now;
        if hostname.is_some() {
            node.hostname = hostname;
        }
        node.clone()
    }

    async fn bump_node_event(&self, name: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        let node = inner.nodes.entry(name.to_string()).or_insert_with(|| Node {
            name: name.to_string(),
            hostname: None,
            is_active: true,
            last_seen: at,
            last_event_time: None,
            total_events: 0,
            total_vms: 0,
        });
        node.last_seen = at;
        node.last_event_time = Some(at);
        node.total_events += 1;
    }

    async fn find_open(&self, node: &str, vm_id: &str) -> Option<Session> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .values()
            .find(|s| s.node == node && s.vm_id == vm_id && s.is_running)
            .cloned()
    }

    async fn open_session(
        &self,
        node: &str,
        vm_id: &str,
        kind: VmKind,
        start_time: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner
            .sessions
            .values()
            .find(|s| s.node == node && s.vm_id == vm_id && s.is_running)
            .cloned()
        {
            return Err(StoreError::AlreadyOpen {
                node: node.to_string(),
                vm_id: vm_id.to_string(),
                existing: Box::new(existing),
            });
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            node: node.to_string(),
            vm_id: vm_id.to_string(),
            kind,
            start_time,
            end_time: None,
            duration_seconds: None,
            is_running: true,
            start_correlator: None,
            stop_correlator: None,
            user: None,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn widen_start(&self, session_id: &str, new_start: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        if new_start < session.start_time {
            session.start_time = new_start;
            session.updated_at = Utc::now();
        }
        Ok(session.clone())
    }

    async fn close_session(&self, session_id: &str, end_time: DateTime<Utc>) -> Result<Session, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        session.end_time = Some(end_time);
        session.is_running = false;
        session.duration_seconds = Some(Self::recompute_duration(session.start_time, end_time));
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn upsert_tracked_vm(
        &self,
        node: &str,
        vm_id: &str,
        name: Option<String>,
        kind: VmKind,
        status: VmStatus,
        last_seen: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().unwrap();
        let key = (node.to_string(), vm_id.to_string());
        let is_new = !inner.tracked_vms.contains_key(&key);
        inner.tracked_vms.insert(
            key,
            TrackedVm {
                node: node.to_string(),
                vm_id: vm_id.to_string(),
                name,
                kind,
                current_status: status,
                last_seen,
            },
        );
        if is_new {
            if let Some(n) = inner.nodes.get_mut(node) {
                n.total_vms += 1;
            }
        }
    }

    async fn open_sessions_for_node(&self, node: &str) -> HashMap<String, Session> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .values()
            .filter(|s| s.node == node && s.is_running)
            .map(|s| (s.vm_id.clone(), s.clone()))
            .collect()
    }

    async fn sessions_overlapping(
        &self,
        vm_id: &str,
        node: Option<&str>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Vec<Session> {
        let inner = self.inner.read().unwrap();
        let now = Utc::now();
        inner
            .sessions
            .values()
            .filter(|s| s.vm_id == vm_id)
            .filter(|s| node.map_or(true, |n| s.node == n))
            .filter(|s| {
                let end = s.end_time.unwrap_or(now);
                s.start_time < t1 && end > t0
            })
            .cloned()
            .collect()
    }

    async fn find_rental(&self, node: Option<&str>, vm_id: &str) -> Option<Rental> {
        let inner = self.inner.read().unwrap();
        inner
            .rentals
            .values()
            .find(|r| r.vm_id == vm_id && r.is_active && (r.node.is_none() || r.node.as_deref() == node))
            .cloned()
    }

    async fn upsert_rental(&self, rental: Rental) {
        let mut inner = self.inner.write().unwrap();
        inner.rentals.insert(rental.id.clone(), rental);
    }

    async fn all_open_for_vm(&self, node: &str, vm_id: &str) -> Vec<Session> {
        let inner = self.inner.read().unwrap();
        inner
            .sessions
            .values()
            .filter(|s| s.node == node && s.vm_id == vm_id && s.is_running)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn open_session_conflicts_on_second_call() {
        let store = InMemorySessionStore::new();
        store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();

        let err = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T10:05:00Z"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyOpen { .. }));
    }

    #[tokio::test]
    async fn widen_start_only_moves_earlier() {
        let store = InMemorySessionStore::new();
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();

        let widened = store.widen_start(&session.id, t("2025-01-01T09:30:00Z")).await.unwrap();
        assert_eq!(widened.start_time, t("2025-01-01T09:30:00Z"));

        let unchanged = store.widen_start(&session.id, t("2025-01-01T11:00:00Z")).await.unwrap();
        assert_eq!(unchanged.start_time, t("2025-01-01T09:30:00Z"));
    }

    #[tokio::test]
    async fn close_session_computes_duration() {
        let store = InMemorySessionStore::new();
        let session = store
            .open_session("a", "42", VmKind::FullVm, t("2025-01-01T10:00:00Z"))
            .await
            .unwrap();

        let closed = store.close_session(&session.id, t("2025-01-01T12:30:00Z")).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(9000));
        assert!(!closed.is_running);
    }
}
