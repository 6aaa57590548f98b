//! Global barrier coordination.
//!
//! A barrier is a rendezvous of all nodes, keyed by a source-site id. The
//! coordinator keeps one countdown per site, initialized to the cluster
//! size on first observation and decremented by its own entry and by every
//! [`MsgKind::BarrierEnter`]; when the countdown hits zero the
//! coordinator's blocked thread erases the round and broadcasts exactly one
//! [`MsgKind::BarrierRelease`]. Participants register their round entry
//! *before* the enter message leaves (both happen under the round-table
//! lock), so a release racing in from the receiver thread can never be
//! lost; they then wait on a released flag, not a bare condition.
//!
//! A site id is reusable once its round completes: the coordinator's erase
//! happens before the release broadcast, so a follow-up round at the same
//! site starts a fresh countdown. Re-entering a site while its previous
//! round is still in flight is not supported.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use crate::config::NodeId;
use crate::site::SiteId;
use crate::transport;
use crate::transport::Transport;
use crate::wire::Header;
use crate::wire::MsgKind;

/// Progress of one barrier round at one site, as seen by this node.
enum RoundState {
    /// Coordinator side: entries still missing.
    Counting {
        /// Nodes that have not entered yet.
        remaining: u64,
    },
    /// Participant side: entered, waiting for the coordinator.
    AwaitingRelease {
        /// The release for this round has arrived.
        released: bool,
    },
}

/// Barrier state shared by accessor threads and receiver threads.
pub(crate) struct BarrierCoordinator {
    self_id: NodeId,
    cluster_size: usize,
    transport: Arc<Transport>,
    rounds: Mutex<HashMap<SiteId, RoundState>>,
    /// Single condition for all sites; waiters re-check their site's round.
    progressed: Condvar,
}

impl BarrierCoordinator {
    pub(crate) fn new(transport: Arc<Transport>) -> Self {
        Self {
            self_id: transport.self_id(),
            cluster_size: transport.cluster_size(),
            transport,
            rounds: Mutex::new(HashMap::new()),
            progressed: Condvar::new(),
        }
    }

    /// Block until every node has entered the barrier at `site`.
    pub(crate) fn wait(&self, site: SiteId) {
        debug!(site, node = %self.self_id, "barrier reached");
        if self.self_id.is_coordinator() {
            self.wait_as_coordinator(site);
        } else {
            self.wait_as_participant(site);
        }
        debug!(site, node = %self.self_id, "barrier passed");
    }

    fn wait_as_coordinator(&self, site: SiteId) {
        let mut rounds = self.rounds.lock();
        let remaining = match rounds
            .entry(site)
            .or_insert(RoundState::Counting { remaining: self.cluster_size as u64 })
        {
            RoundState::Counting { remaining } => {
                *remaining -= 1;
                *remaining
            }
            RoundState::AwaitingRelease { .. } => {
                warn!(site, "coordinator found a participant round at its own barrier");
                return;
            }
        };
        if remaining > 0 {
            debug!(site, remaining, "waiting for the rest of the cluster");
            loop {
                self.progressed.wait(&mut rounds);
                match rounds.get(&site) {
                    Some(RoundState::Counting { remaining }) if *remaining > 0 => continue,
                    _ => break,
                }
            }
        }
        // The round is complete. Erase it before the release goes out so
        // the site id is immediately reusable for the next round.
        rounds.remove(&site);
        drop(rounds);
        if let Err(err) = self
            .transport
            .broadcast(&Header::new(MsgKind::BarrierRelease, site, self.self_id.0))
        {
            transport::fatal(&err);
        }
    }

    fn wait_as_participant(&self, site: SiteId) {
        let mut rounds = self.rounds.lock();
        if rounds.contains_key(&site) {
            warn!(site, "barrier re-entered before its previous round completed");
        } else {
            rounds.insert(site, RoundState::AwaitingRelease { released: false });
        }
        // Registered under the lock: the release handler takes the same
        // lock, so it cannot observe the enter before the entry exists.
        if let Err(err) = self
            .transport
            .send(
                NodeId::COORDINATOR,
                &Header::new(MsgKind::BarrierEnter, site, self.self_id.0),
            )
        {
            transport::fatal(&err);
        }
        loop {
            match rounds.get(&site) {
                Some(RoundState::AwaitingRelease { released: true }) | None => break,
                _ => self.progressed.wait(&mut rounds),
            }
        }
        rounds.remove(&site);
    }

    /// Receiver-thread entry: a participant reached the barrier at `site`.
    pub(crate) fn handle_enter(&self, site: SiteId, from: NodeId) {
        if !self.self_id.is_coordinator() {
            warn!(site, %from, "barrier entry received by a non-coordinator, dropping");
            return;
        }
        let mut rounds = self.rounds.lock();
        match rounds
            .entry(site)
            .or_insert(RoundState::Counting { remaining: self.cluster_size as u64 })
        {
            RoundState::Counting { remaining } => {
                if *remaining == 0 {
                    warn!(site, %from, "barrier entry past a completed round, dropping");
                    return;
                }
                *remaining -= 1;
                debug!(site, %from, remaining = *remaining, "barrier entry recorded");
                if *remaining == 0 {
                    self.progressed.notify_all();
                }
            }
            RoundState::AwaitingRelease { .. } => {
                warn!(site, %from, "barrier entry collided with a participant round");
            }
        }
    }

    /// Receiver-thread entry: the coordinator released the round at `site`.
    pub(crate) fn handle_release(&self, site: SiteId) {
        if self.self_id.is_coordinator() {
            warn!(site, "barrier release received by the coordinator, dropping");
            return;
        }
        let mut rounds = self.rounds.lock();
        match rounds.get_mut(&site) {
            Some(RoundState::AwaitingRelease { released }) => {
                *released = true;
                self.progressed.notify_all();
            }
            _ => warn!(site, "barrier release with no local participant, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    #[test]
    fn single_node_barrier_is_immediate() {
        let config = ClusterConfig::new(vec!["127.0.0.1".parse().unwrap()], 2000);
        let (transport, _) = Transport::connect(&config, NodeId(0)).unwrap();
        let barrier = BarrierCoordinator::new(Arc::new(transport));
        // Two rounds at the same site: the id is reusable after each.
        barrier.wait(11);
        barrier.wait(11);
        assert!(barrier.rounds.lock().is_empty());
    }
}
