//! The coherence engine: per-variable ownership state machine.
//!
//! Implements a single-writer / multi-reader protocol in the MSI family.
//! One node owns each variable at any time; writers must hold exclusive
//! ownership, readers must hold a valid cache. Ownership migrates on
//! demand ([`MsgKind::ReqOwn`] / [`MsgKind::GrantOwn`]), values move on
//! demand ([`MsgKind::AskValue`] / [`MsgKind::SetValue`]), and a shared
//! owner reclaims exclusivity by invalidating every cache and draining the
//! acks before mutating.
//!
//! # Ownership requests
//!
//! `ReqOwn` is broadcast: only the current owner answers with `GrantOwn`;
//! every non-owner answers with `SetOwner`, its best guess of the owner.
//! A requester acts on `SetOwner` only while its request is outstanding,
//! re-issuing `ReqOwn` unicast to the hinted node; hints that arrive after
//! the grant are stragglers from the original broadcast and are dropped.
//! `AskValue` sent to a node that lost ownership in the meantime draws the
//! same `SetOwner` reply; with no request outstanding it re-points the
//! local owner hint and wakes blocked readers, which then ask the hinted
//! node. FIFO per peer pair makes both cascades converge on the real
//! owner.
//!
//! # Local writes and deferral
//!
//! A local write spans `before_write` entry (the exclusivity acquisition
//! included) to `after_write` (publish). Requests that arrive in that span
//! cannot be answered inline: a value served now would be bytes the
//! imminent store silently overwrites with no invalidation to correct
//! them, and ownership granted now would hand the variable away under the
//! in-flight mutation, orphaning it. Both kinds are queued on the record
//! and answered at `after_write`: value requests with the fresh payload,
//! ownership requests with a `SetOwner` hint naming this node. The hint is
//! load-bearing — a request can go stale while parked (its sender may have
//! been served by a previous owner already), and an unsolicited grant
//! would strand the ownership token, so the requester is made to re-issue
//! and a grant only ever answers a live request. Invalidations are never
//! deferred; their acks are what an owner's drain is waiting on. The
//! receiver thread never blocks for any of this.

use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::config::NodeId;
use crate::registry::CoherenceState;
use crate::registry::Registry;
use crate::site::SiteId;
use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::wire::Header;
use crate::wire::MsgKind;

/// The per-node coherence engine.
pub(crate) struct CoherenceEngine {
    self_id: NodeId,
    cluster_size: usize,
    pub(crate) registry: Registry,
    transport: Arc<Transport>,
}

impl CoherenceEngine {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        let self_id = transport.self_id();
        Self {
            self_id,
            cluster_size: transport.cluster_size(),
            registry: Registry::new(self_id),
            transport,
        }
    }

    fn send(&self, dst: NodeId, header: &Header) {
        if let Err(err) = self.transport.send(dst, header) {
            transport::fatal(&err);
        }
    }

    fn broadcast(&self, header: &Header) {
        if let Err(err) = self.transport.broadcast(header) {
            transport::fatal(&err);
        }
    }

    /// Register a newly declared variable.
    pub(crate) fn on_create(&self, var_id: SiteId, initial: &[u8]) {
        debug!(var_id, size = initial.len(), "variable declared");
        self.registry.insert(var_id, initial);
    }

    /// Tear down a variable: broadcast its final bytes, then drop the
    /// record.
    ///
    /// The broadcast lets peers whose records are still live observe the
    /// last value; peers that already destroyed theirs drop the message.
    /// A send failure is reported but the local record is removed either
    /// way.
    pub(crate) fn on_destroy(&self, var_id: SiteId, payload: &[u8]) -> Result<(), TransportError> {
        if self.registry.lookup(var_id).is_none() {
            warn!(var_id, "destroy of unknown variable");
            return Ok(());
        }
        debug!(var_id, "variable destroyed, broadcasting final value");
        let header = Header::new(MsgKind::SetValue, var_id, payload.len() as u64);
        let result = self.transport.broadcast_pair(&header, payload);
        self.registry.remove(var_id);
        result.map_err(|err| {
            warn!(var_id, error = %err, "final value broadcast failed");
            err
        })
    }

    /// Block until the local copy of `var_id` is readable (owner or valid
    /// cache).
    ///
    /// On a stale cache this asks the owner for the current value and waits
    /// for it to land. The loop re-checks after every wake: the value can
    /// go stale again (a concurrent invalidation) before the reader runs,
    /// in which case it re-fetches from the new owner.
    pub(crate) fn before_read(&self, var_id: SiteId) {
        let Some(record) = self.registry.lookup(var_id) else {
            warn!(var_id, "read of unknown variable");
            return;
        };
        let mut body = record.body.lock();
        while body.state == CoherenceState::RemoteStale {
            let owner = body.remote_owner;
            debug!(var_id, %owner, "cache stale, requesting current value");
            self.send(owner, &Header::new(MsgKind::AskValue, var_id, self.self_id.0));
            record.value_ready.wait(&mut body);
        }
    }

    /// Block until this node holds `var_id` exclusively, and open the
    /// local-write span ended by [`CoherenceEngine::after_write`].
    pub(crate) fn before_write(&self, var_id: SiteId) {
        let Some(record) = self.registry.lookup(var_id) else {
            warn!(var_id, "write of unknown variable");
            return;
        };
        let mut body = record.body.lock();
        // The write span opens before exclusivity is acquired: requests
        // landing during the invalidation drain or the grant wait defer to
        // the fresh payload too. Once the span is open, ownership cannot
        // leave this node until `after_write` closes it.
        body.local_writers += 1;
        match body.state {
            CoherenceState::OwnerExclusive => {}
            CoherenceState::OwnerShared => {
                if body.pending_invalidations == 0 {
                    // Latch the expected ack count before any peer can
                    // respond.
                    body.pending_invalidations = (self.cluster_size - 1) as u64;
                    debug!(
                        var_id,
                        peers = body.pending_invalidations,
                        "invalidating remote caches"
                    );
                    self.broadcast(&Header::new(MsgKind::Invalidate, var_id, self.self_id.0));
                }
                while body.pending_invalidations > 0 {
                    record.invalidations_drained.wait(&mut body);
                }
                body.state = CoherenceState::OwnerExclusive;
            }
            CoherenceState::RemoteCached | CoherenceState::RemoteStale => {
                if !body.awaiting_grant {
                    body.awaiting_grant = true;
                    debug!(var_id, "requesting ownership");
                    self.broadcast(&Header::new(MsgKind::ReqOwn, var_id, self.self_id.0));
                }
                while body.awaiting_grant {
                    record.ownership_granted.wait(&mut body);
                }
                // The grant handler switched the record to exclusive.
            }
        }
    }

    /// Close a local-write span: publish the fresh payload to every request
    /// deferred while the write was in flight.
    pub(crate) fn after_write(&self, var_id: SiteId) {
        let Some(record) = self.registry.lookup(var_id) else {
            return;
        };
        let mut body = record.body.lock();
        body.local_writers = body.local_writers.saturating_sub(1);
        if body.local_writers > 0 {
            return;
        }

        let value_requests = std::mem::take(&mut body.deferred_value_requests);
        let ownership_requests = std::mem::take(&mut body.deferred_ownership_requests);
        if value_requests.is_empty() && ownership_requests.is_empty() {
            return;
        }
        if body.state.is_owner() {
            if !value_requests.is_empty() {
                body.state = CoherenceState::OwnerShared;
                let header = Header::new(MsgKind::SetValue, var_id, body.payload.len() as u64);
                for peer in value_requests {
                    debug!(var_id, %peer, "serving value request deferred across local write");
                    if let Err(err) = self.transport.send_pair(peer, &header, &body.payload) {
                        transport::fatal(&err);
                    }
                }
            }
            // A request parked here may have been satisfied by a previous
            // owner in the meantime; the hint makes the requester re-issue,
            // so a grant only ever answers a live request.
            for peer in ownership_requests {
                debug!(var_id, %peer, "inviting deferred ownership requester to re-issue");
                self.send(peer, &Header::new(MsgKind::SetOwner, var_id, self.self_id.0));
            }
        } else {
            // Ownership left this node while the span was open; point every
            // deferred requester at the new owner instead.
            let hint = body.remote_owner;
            for peer in value_requests.into_iter().chain(ownership_requests) {
                debug!(var_id, %peer, %hint, "redirecting request deferred across local write");
                self.send(peer, &Header::new(MsgKind::SetOwner, var_id, hint.0));
            }
        }
    }

    /// Dispatch one coherence message received from `from`.
    pub(crate) fn handle(&self, from: NodeId, header: Header, payload: Option<&[u8]>) {
        match header.kind {
            MsgKind::ReqOwn => self.on_req_own(header.id, NodeId(header.aux)),
            MsgKind::GrantOwn => self.on_grant_own(header.id),
            MsgKind::SetOwner => self.on_set_owner(header.id, NodeId(header.aux)),
            MsgKind::AskValue => self.on_ask_value(header.id, NodeId(header.aux)),
            MsgKind::SetValue => self.on_set_value(header.id, payload.unwrap_or_default()),
            MsgKind::Invalidate => self.on_invalidate(header.id, NodeId(header.aux)),
            MsgKind::InvalAck => self.on_inval_ack(header.id, NodeId(header.aux)),
            MsgKind::BarrierEnter | MsgKind::BarrierRelease => {
                warn!(kind = ?header.kind, %from, "barrier message routed to coherence engine");
            }
        }
    }

    fn on_req_own(&self, var_id: SiteId, requester: NodeId) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, %requester, "ownership request for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if body.local_writers > 0 {
            // Granting now would hand the variable away under an in-flight
            // local mutation; answered at `after_write` instead.
            if !body.deferred_ownership_requests.contains(&requester) {
                body.deferred_ownership_requests.push(requester);
            }
            return;
        }
        if body.state.is_owner() {
            debug!(var_id, %requester, "granting ownership");
            body.state = CoherenceState::RemoteStale;
            body.remote_owner = requester;
            self.send(requester, &Header::new(MsgKind::GrantOwn, var_id, self.self_id.0));
        } else {
            let hint = body.remote_owner;
            debug!(var_id, %requester, %hint, "not the owner, redirecting requester");
            self.send(requester, &Header::new(MsgKind::SetOwner, var_id, hint.0));
        }
    }

    fn on_grant_own(&self, var_id: SiteId) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, "ownership grant for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if !body.awaiting_grant {
            warn!(var_id, "ownership grant without a pending request, dropping");
            return;
        }
        body.awaiting_grant = false;
        body.state = CoherenceState::OwnerExclusive;
        record.ownership_granted.notify_all();
        // Becoming the owner also makes the local copy authoritative;
        // readers parked on a stale cache must re-check.
        record.value_ready.notify_all();
    }

    fn on_set_owner(&self, var_id: SiteId, hint: NodeId) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, "owner hint for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if hint == self.self_id {
            // Someone already believes we own it; if we asked for
            // ownership, the matching grant is in flight on that channel.
            // A parked reader may already sit on an authoritative copy (a
            // concurrent local write consumed the grant), so poke it.
            debug!(var_id, "owner hint names this node, dropping");
            record.value_ready.notify_all();
            return;
        }
        if body.awaiting_grant {
            debug!(var_id, %hint, "redirected, re-requesting ownership");
            body.state = CoherenceState::RemoteStale;
            body.remote_owner = hint;
            self.send(hint, &Header::new(MsgKind::ReqOwn, var_id, self.self_id.0));
            return;
        }
        if body.state == CoherenceState::RemoteStale {
            // A value request of ours hit a node that lost ownership in the
            // meantime. Update the hint and poke any blocked readers; they
            // re-ask the hinted node.
            debug!(var_id, %hint, "owner moved, redirecting blocked readers");
            body.remote_owner = hint;
            record.value_ready.notify_all();
            return;
        }
        debug!(var_id, %hint, "stale owner hint dropped");
    }

    fn on_ask_value(&self, var_id: SiteId, requester: NodeId) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, %requester, "value request for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if body.local_writers > 0 {
            if !body.deferred_value_requests.contains(&requester) {
                body.deferred_value_requests.push(requester);
            }
            return;
        }
        if body.state.is_owner() {
            debug!(var_id, %requester, "serving current value");
            body.state = CoherenceState::OwnerShared;
            let header = Header::new(MsgKind::SetValue, var_id, body.payload.len() as u64);
            if let Err(err) = self.transport.send_pair(requester, &header, &body.payload) {
                transport::fatal(&err);
            }
        } else {
            let hint = body.remote_owner;
            debug!(var_id, %requester, %hint, "value requested from a non-owner, redirecting");
            self.send(requester, &Header::new(MsgKind::SetOwner, var_id, hint.0));
        }
    }

    fn on_set_value(&self, var_id: SiteId, payload: &[u8]) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, "value for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if body.payload.len() != payload.len() {
            warn!(
                var_id,
                have = body.payload.len(),
                got = payload.len(),
                "value with mismatched size dropped"
            );
            return;
        }
        body.payload.copy_from_slice(payload);
        if body.state == CoherenceState::RemoteStale {
            body.state = CoherenceState::RemoteCached;
        }
        record.value_ready.notify_all();
    }

    fn on_invalidate(&self, var_id: SiteId, invalidator: NodeId) {
        // The ack goes out even when the variable is locally unknown
        // (already destroyed here): the invalidating writer counts acks
        // from every peer and would otherwise wait forever.
        if let Some(record) = self.registry.lookup(var_id) {
            let mut body = record.body.lock();
            body.state = CoherenceState::RemoteStale;
            body.remote_owner = invalidator;
        } else {
            debug!(var_id, %invalidator, "invalidation for unknown variable, acking anyway");
        }
        self.send(invalidator, &Header::new(MsgKind::InvalAck, var_id, self.self_id.0));
    }

    fn on_inval_ack(&self, var_id: SiteId, acker: NodeId) {
        let Some(record) = self.registry.lookup(var_id) else {
            debug!(var_id, %acker, "invalidation ack for unknown variable dropped");
            return;
        };
        let mut body = record.body.lock();
        if body.pending_invalidations == 0 {
            warn!(var_id, %acker, "invalidation ack past a drained counter, dropping");
            return;
        }
        body.pending_invalidations -= 1;
        if body.pending_invalidations == 0 {
            record.invalidations_drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn single_node_engine() -> CoherenceEngine {
        let config = ClusterConfig::new(vec!["127.0.0.1".parse().unwrap()], 2000);
        let (transport, receivers) = Transport::connect(&config, NodeId(0)).unwrap();
        assert!(receivers.is_empty());
        CoherenceEngine::new(Arc::new(transport))
    }

    #[test]
    fn single_node_write_goes_exclusive_without_messages() {
        let engine = single_node_engine();
        engine.on_create(1, &[0; 8]);
        assert_eq!(
            engine.registry.state_of(1),
            Some(CoherenceState::OwnerShared)
        );

        engine.before_write(1);
        assert_eq!(
            engine.registry.state_of(1),
            Some(CoherenceState::OwnerExclusive)
        );
        engine.registry.copy_payload_from(1, &9u64.to_le_bytes());
        engine.after_write(1);

        engine.before_read(1);
        let mut out = [0u8; 8];
        engine.registry.copy_payload_to(1, &mut out);
        assert_eq!(u64::from_le_bytes(out), 9);
    }

    #[test]
    fn single_node_destroy_succeeds_with_no_peers() {
        let engine = single_node_engine();
        engine.on_create(2, &[7; 4]);
        engine.on_destroy(2, &[7; 4]).unwrap();
        assert!(engine.registry.state_of(2).is_none());
        // A second destroy is a logged usage error, not a failure.
        engine.on_destroy(2, &[7; 4]).unwrap();
    }

    #[test]
    fn grant_without_request_is_dropped() {
        let engine = single_node_engine();
        engine.on_create(3, &[0; 4]);
        engine.handle(NodeId(0), Header::new(MsgKind::GrantOwn, 3, 0), None);
        assert_eq!(
            engine.registry.state_of(3),
            Some(CoherenceState::OwnerShared)
        );
    }

    #[test]
    fn set_value_refreshes_owner_payload_in_place() {
        let engine = single_node_engine();
        engine.on_create(4, &[0; 8]);
        engine.handle(
            NodeId(0),
            Header::new(MsgKind::SetValue, 4, 8),
            Some(&42u64.to_le_bytes()),
        );
        // State is untouched; only the bytes refresh.
        assert_eq!(
            engine.registry.state_of(4),
            Some(CoherenceState::OwnerShared)
        );
        let mut out = [0u8; 8];
        engine.registry.copy_payload_to(4, &mut out);
        assert_eq!(u64::from_le_bytes(out), 42);
    }

    #[test]
    fn mismatched_value_size_is_dropped() {
        let engine = single_node_engine();
        engine.on_create(5, &[1; 8]);
        engine.handle(
            NodeId(0),
            Header::new(MsgKind::SetValue, 5, 2),
            Some(&[9, 9]),
        );
        let mut out = [0u8; 8];
        engine.registry.copy_payload_to(5, &mut out);
        assert_eq!(out, [1; 8]);
    }

    #[test]
    fn unexpected_inval_ack_is_dropped() {
        let engine = single_node_engine();
        engine.on_create(6, &[0; 4]);
        // No invalidation round is open; the ack must not underflow.
        engine.handle(NodeId(0), Header::new(MsgKind::InvalAck, 6, 0), None);
        engine.handle(NodeId(0), Header::new(MsgKind::InvalAck, 6, 0), None);
        assert_eq!(
            engine.registry.state_of(6),
            Some(CoherenceState::OwnerShared)
        );
    }
}
