//! Force-sync registry — the set of node names with a pending sync
//! request, drained by the heartbeat operation.
//!
//! Process-wide state guarded by a single lock, same as the source's
//! global mutable map; losing it on restart is benign since an operator
//! will just reissue the force-sync request.

use std::collections::HashSet;
use std::sync::RwLock;

const WILDCARD: &str = "*";

#[derive(Default)]
pub struct ForceSyncRegistry {
    pending: RwLock<HashSet<String>>,
    all_pending: RwLock<bool>,
}

impl ForceSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a sync. `target` of `None` or `"*"` requests every node.
    /// Returns the number of nodes notified (best-effort count; for the
    /// wildcard case this is the count of nodes known at request time).
    pub fn request(&self, target: Option<&str>, known_nodes: &[String]) -> usize {
        match target {
            None | Some(WILDCARD) => {
                *self.all_pending.write().unwrap() = true;
                let mut pending = self.pending.write().unwrap();
                for node in known_nodes {
                    pending.insert(node.clone());
                }
                known_nodes.len()
            }
            Some(node) => {
                self.pending.write().unwrap().insert(node.to_string());
                1
            }
        }
    }

    /// Read-and-clear the pending bit for one node — called from the
    /// heartbeat reply path. The agent clears its own local copy only
    /// after a successful snapshot send, so we clear here unconditionally
    /// once the bit has been handed off in a reply.
    pub fn drain(&self, node: &str) -> bool {
        let mut pending = self.pending.write().unwrap();
        let was_pending = pending.remove(node) || *self.all_pending.read().unwrap();
        was_pending
    }

    /// Clear the wildcard flag once every currently-known node has been
    /// drained at least once (called periodically by the caller; not
    /// required for correctness, just housekeeping).
    pub fn clear_wildcard(&self) {
        *self.all_pending.write().unwrap() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targeted_request_only_notifies_one_node() {
        let registry = ForceSyncRegistry::new();
        let notified = registry.request(Some("pve1"), &["pve1".into(), "pve2".into()]);
        assert_eq!(notified, 1);
        assert!(registry.drain("pve1"));
        assert!(!registry.drain("pve2"));
    }

    #[test]
    fn wildcard_request_notifies_every_known_node() {
        let registry = ForceSyncRegistry::new();
        let nodes = vec!["pve1".to_string(), "pve2".to_string()];
        let notified = registry.request(None, &nodes);
        assert_eq!(notified, 2);
        assert!(registry.drain("pve1"));
        assert!(registry.drain("pve2"));
    }
}
