//! Variable registry: the id → record map and the records themselves.
//!
//! Every variable a node has declared gets one record. The record
//! owns the authoritative local copy of the payload bytes and all the
//! synchronization state the coherence engine needs: the coherence state,
//! the current owner hint, the pending-invalidation count, and the wait
//! conditions accessor threads block on.
//!
//! Lock discipline: the registry-wide map lock is only ever held for map
//! mutation and lookup, never across a wait or a network send. Per-record
//! state lives behind the record's own mutex; the engine may send while
//! holding it (the transport's per-destination mutex keeps the emitted
//! message consistent with the state transition it accompanies). No record
//! lock is ever held while acquiring another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::NodeId;
use crate::site::SiteId;

/// Coherence state of one variable on one node.
///
/// Cluster-wide, at most one node is in an owner state for a given variable
/// whenever the system is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherenceState {
    /// This node owns the variable and no remote cache holds a copy.
    OwnerExclusive,
    /// This node owns the variable; remote caches may hold the value.
    OwnerShared,
    /// A remote node owns the variable; the local copy is valid.
    RemoteCached,
    /// A remote node owns the variable; the local copy must be refreshed
    /// before the next read.
    RemoteStale,
}

impl CoherenceState {
    /// Whether this node currently owns the variable.
    pub fn is_owner(self) -> bool {
        matches!(self, Self::OwnerExclusive | Self::OwnerShared)
    }
}

/// Mutable per-variable state, guarded by the record mutex.
pub(crate) struct VarBody {
    /// Current coherence state.
    pub state: CoherenceState,
    /// Best local guess of the owning node; meaningful only in the
    /// `Remote*` states.
    pub remote_owner: NodeId,
    /// The local payload copy. Fixed length for the variable's lifetime.
    pub payload: Vec<u8>,
    /// Acks still outstanding for an invalidation round started locally.
    pub pending_invalidations: u64,
    /// An ownership request is in flight and unanswered.
    pub awaiting_grant: bool,
    /// Local writes currently between `before_write` and `after_write`.
    pub local_writers: u32,
    /// Peers whose value requests arrived during the local write and will
    /// be answered at `after_write`.
    pub deferred_value_requests: Vec<NodeId>,
    /// Peers whose ownership requests arrived during the local write and
    /// will be answered at `after_write`.
    pub deferred_ownership_requests: Vec<NodeId>,
}

/// One variable's record: payload, state, and wait conditions.
pub(crate) struct VarRecord {
    pub body: Mutex<VarBody>,
    /// Signaled when a requested value lands (read against a stale cache).
    pub value_ready: Condvar,
    /// Signaled when an ownership grant arrives.
    pub ownership_granted: Condvar,
    /// Signaled when the last invalidation ack arrives.
    pub invalidations_drained: Condvar,
}

impl VarRecord {
    fn new(state: CoherenceState, payload: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(VarBody {
                state,
                remote_owner: NodeId::COORDINATOR,
                payload,
                pending_invalidations: 0,
                awaiting_grant: false,
                local_writers: 0,
                deferred_value_requests: Vec::new(),
                deferred_ownership_requests: Vec::new(),
            }),
            value_ready: Condvar::new(),
            ownership_granted: Condvar::new(),
            invalidations_drained: Condvar::new(),
        }
    }
}

/// Map from variable id to record.
pub struct Registry {
    self_id: NodeId,
    vars: RwLock<HashMap<SiteId, Arc<VarRecord>>>,
}

impl Registry {
    pub(crate) fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            vars: RwLock::new(HashMap::new()),
        }
    }

    /// Insert the record for a newly declared variable.
    ///
    /// On the coordinator the variable starts owned (shared, since peers
    /// declare their own copies); elsewhere it starts as a cache of the
    /// coordinator's copy holding the locally supplied initial bytes. A
    /// second insert for the same id is a usage error: it is logged and the
    /// existing record is kept.
    pub(crate) fn insert(&self, var_id: SiteId, initial: &[u8]) {
        let state = if self.self_id.is_coordinator() {
            CoherenceState::OwnerShared
        } else {
            CoherenceState::RemoteCached
        };
        let record = Arc::new(VarRecord::new(state, initial.to_vec()));
        let mut vars = self.vars.write();
        if vars.contains_key(&var_id) {
            warn!(var_id, "variable declared twice, keeping the first record");
            return;
        }
        vars.insert(var_id, record);
    }

    /// Remove a record; returns it if it existed.
    pub(crate) fn remove(&self, var_id: SiteId) -> Option<Arc<VarRecord>> {
        self.vars.write().remove(&var_id)
    }

    /// Fetch the record for `var_id`, if this node declared it.
    pub(crate) fn lookup(&self, var_id: SiteId) -> Option<Arc<VarRecord>> {
        self.vars.read().get(&var_id).cloned()
    }

    /// The coherence state of `var_id`, for diagnostics and tests.
    pub fn state_of(&self, var_id: SiteId) -> Option<CoherenceState> {
        self.lookup(var_id).map(|record| record.body.lock().state)
    }

    /// Copy the variable's current bytes into `out`.
    ///
    /// `out` must match the variable's payload size. Returns `false` (with
    /// `out` untouched) if the variable is unknown.
    pub fn copy_payload_to(&self, var_id: SiteId, out: &mut [u8]) -> bool {
        let Some(record) = self.lookup(var_id) else {
            warn!(var_id, "payload read for unknown variable");
            return false;
        };
        let body = record.body.lock();
        if body.payload.len() != out.len() {
            warn!(
                var_id,
                have = body.payload.len(),
                want = out.len(),
                "payload size mismatch on read"
            );
            return false;
        }
        out.copy_from_slice(&body.payload);
        true
    }

    /// Overwrite the variable's bytes from `data`.
    ///
    /// `data` must match the variable's payload size. Returns `false` if
    /// the variable is unknown or the size differs.
    pub fn copy_payload_from(&self, var_id: SiteId, data: &[u8]) -> bool {
        let Some(record) = self.lookup(var_id) else {
            warn!(var_id, "payload write for unknown variable");
            return false;
        };
        let mut body = record.body.lock();
        if body.payload.len() != data.len() {
            warn!(
                var_id,
                have = body.payload.len(),
                want = data.len(),
                "payload size mismatch on write"
            );
            return false;
        }
        body.payload.copy_from_slice(data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_declares_owned_shared() {
        let registry = Registry::new(NodeId(0));
        registry.insert(7, &[1, 2, 3, 4]);
        assert_eq!(registry.state_of(7), Some(CoherenceState::OwnerShared));
    }

    #[test]
    fn non_coordinator_declares_cached() {
        let registry = Registry::new(NodeId(2));
        registry.insert(7, &[0; 4]);
        assert_eq!(registry.state_of(7), Some(CoherenceState::RemoteCached));
        let record = registry.lookup(7).unwrap();
        assert_eq!(record.body.lock().remote_owner, NodeId::COORDINATOR);
    }

    #[test]
    fn double_declaration_keeps_first_record() {
        let registry = Registry::new(NodeId(0));
        registry.insert(7, &[1, 1]);
        registry.insert(7, &[2, 2]);
        let mut out = [0u8; 2];
        assert!(registry.copy_payload_to(7, &mut out));
        assert_eq!(out, [1, 1]);
    }

    #[test]
    fn payload_roundtrip() {
        let registry = Registry::new(NodeId(0));
        registry.insert(3, &[0; 8]);
        assert!(registry.copy_payload_from(3, &42u64.to_le_bytes()));
        let mut out = [0u8; 8];
        assert!(registry.copy_payload_to(3, &mut out));
        assert_eq!(u64::from_le_bytes(out), 42);
    }

    #[test]
    fn size_mismatch_is_refused() {
        let registry = Registry::new(NodeId(0));
        registry.insert(3, &[0; 8]);
        assert!(!registry.copy_payload_from(3, &[1, 2]));
        let mut short = [0u8; 2];
        assert!(!registry.copy_payload_to(3, &mut short));
    }

    #[test]
    fn unknown_variable_lookups() {
        let registry = Registry::new(NodeId(1));
        assert!(registry.lookup(99).is_none());
        assert_eq!(registry.state_of(99), None);
        assert!(!registry.copy_payload_to(99, &mut [0u8; 4]));
        assert!(!registry.copy_payload_from(99, &[0u8; 4]));
    }
}
