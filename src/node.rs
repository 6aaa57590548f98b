//! The node runtime: bootstrap, receiver threads, and the access façade.
//!
//! A [`Node`] is the process-wide context tying the subsystems together:
//! the transport mesh, the coherence engine, and the barrier coordinator.
//! It is constructed once at startup and passed by reference to every
//! proxy; there are no globals and teardown is explicit.
//!
//! # Threads
//!
//! Bootstrap spawns exactly one receiver thread per remote peer. Each
//! thread loops on its inbound channel: read a header, read the trailing
//! payload if the kind carries one, dispatch to the coherence engine or
//! the barrier coordinator, and go back to reading. Dispatch runs inline
//! on the receiver thread and never blocks on protocol progress, so the
//! channel it serves keeps draining.
//!
//! Accessor threads are whatever threads the application calls the façade
//! from; any number may block in `before_read`, `before_write`, or
//! `barrier` concurrently.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::barrier::BarrierCoordinator;
use crate::config::ClusterConfig;
use crate::config::ConfigError;
use crate::config::NodeId;
use crate::engine::CoherenceEngine;
use crate::registry::CoherenceState;
use crate::site::SiteId;
use crate::transport;
use crate::transport::PeerReceiver;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::wire::Header;
use crate::wire::MsgKind;
use crate::wire::HEADER_LEN;

/// Errors that can stop a node from bootstrapping.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The cluster configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The mesh could not be established.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// State shared between accessor threads and receiver threads.
struct NodeShared {
    transport: Arc<Transport>,
    engine: CoherenceEngine,
    barrier: BarrierCoordinator,
}

/// A running cluster node.
///
/// Dropping the node shuts the mesh down and joins the receiver threads.
pub struct Node {
    shared: Arc<NodeShared>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Join the cluster as node `index` and wait for the full mesh.
    ///
    /// Blocks until a channel exists in both directions for every peer, so
    /// returning means the whole cluster has started.
    pub fn bootstrap(config: &ClusterConfig, index: u64) -> Result<Node, NodeError> {
        let self_id = config.node_id(index)?;
        info!(node = %self_id, cluster_size = config.cluster_size(), "joining the mesh");
        let (transport, receivers) = Transport::connect(config, self_id)?;
        let transport = Arc::new(transport);
        let shared = Arc::new(NodeShared {
            engine: CoherenceEngine::new(Arc::clone(&transport)),
            barrier: BarrierCoordinator::new(Arc::clone(&transport)),
            transport,
        });
        let handles = receivers
            .into_iter()
            .map(|rx| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("pbsm-recv-{}", rx.peer()))
                    .spawn(move || receive_loop(shared, rx))
                    .expect("spawning receiver thread")
            })
            .collect();
        info!(node = %self_id, "node running");
        Ok(Node {
            shared,
            receivers: Mutex::new(handles),
        })
    }

    /// This node's id.
    pub fn self_id(&self) -> NodeId {
        self.shared.transport.self_id()
    }

    /// Total number of nodes in the cluster, including this one.
    pub fn cluster_size(&self) -> usize {
        self.shared.transport.cluster_size()
    }

    /// Whether this node is the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.self_id().is_coordinator()
    }

    /// Declare a variable with its initial bytes.
    pub fn on_create(&self, var_id: SiteId, initial: &[u8]) {
        self.shared.engine.on_create(var_id, initial);
    }

    /// Tear a variable down, broadcasting `payload` as its final value.
    pub fn on_destroy(&self, var_id: SiteId, payload: &[u8]) -> Result<(), TransportError> {
        self.shared.engine.on_destroy(var_id, payload)
    }

    /// Block until the local copy of `var_id` is current enough to read.
    pub fn before_read(&self, var_id: SiteId) {
        self.shared.engine.before_read(var_id);
    }

    /// Block until this node may mutate `var_id`; pair with
    /// [`Node::after_write`].
    pub fn before_write(&self, var_id: SiteId) {
        self.shared.engine.before_write(var_id);
    }

    /// Close the write opened by [`Node::before_write`].
    pub fn after_write(&self, var_id: SiteId) {
        self.shared.engine.after_write(var_id);
    }

    /// Rendezvous with every other node at `site`.
    pub fn barrier(&self, site: SiteId) {
        self.shared.barrier.wait(site);
    }

    /// Copy the variable's current bytes out. For proxy layers; call after
    /// [`Node::before_read`] returned.
    pub fn copy_payload_to(&self, var_id: SiteId, out: &mut [u8]) -> bool {
        self.shared.engine.registry.copy_payload_to(var_id, out)
    }

    /// Overwrite the variable's bytes. For proxy layers; call between
    /// [`Node::before_write`] and [`Node::after_write`].
    pub fn copy_payload_from(&self, var_id: SiteId, data: &[u8]) -> bool {
        self.shared.engine.registry.copy_payload_from(var_id, data)
    }

    /// The local coherence state of `var_id`, for diagnostics and tests.
    pub fn coherence_state(&self, var_id: SiteId) -> Option<CoherenceState> {
        self.shared.engine.registry.state_of(var_id)
    }

    /// Close the mesh and join the receiver threads. Idempotent.
    ///
    /// Must not be called while protocol operations are still in flight
    /// anywhere in the cluster; a final barrier before teardown is the
    /// usual way to get there.
    pub fn shutdown(&self) {
        self.shared.transport.begin_shutdown();
        let mut receivers = self.receivers.lock();
        for handle in receivers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One iteration per inbound message; runs until the channel closes.
fn receive_loop(shared: Arc<NodeShared>, mut rx: PeerReceiver) {
    let peer = rx.peer();
    debug!(%peer, "receiver thread running");
    let mut header_buf = [0u8; HEADER_LEN];
    loop {
        match rx.recv_exact(&mut header_buf) {
            Ok(true) => {}
            Ok(false) => {
                debug!(%peer, "peer channel closed");
                break;
            }
            Err(err) => {
                if shared.transport.is_shutting_down() {
                    break;
                }
                transport::fatal(&err);
            }
        }
        let header = match Header::decode(&header_buf) {
            Ok(header) => header,
            Err(err) => {
                warn!(%peer, error = %err, "undecodable message dropped");
                continue;
            }
        };
        // A value's payload rides directly behind its header on this
        // channel; consume it before dispatch even if the variable turns
        // out to be unknown, or the stream desynchronizes.
        let payload = if header.kind.has_payload() {
            let mut buf = vec![0u8; header.aux as usize];
            match rx.recv_exact(&mut buf) {
                Ok(true) => Some(buf),
                Ok(false) => {
                    if shared.transport.is_shutting_down() {
                        break;
                    }
                    transport::fatal(&TransportError::ChannelClosed { peer });
                }
                Err(err) => {
                    if shared.transport.is_shutting_down() {
                        break;
                    }
                    transport::fatal(&err);
                }
            }
        } else {
            None
        };
        match header.kind {
            MsgKind::BarrierEnter => shared.barrier.handle_enter(header.id, NodeId(header.aux)),
            MsgKind::BarrierRelease => shared.barrier.handle_release(header.id),
            _ => shared.engine.handle(peer, header, payload.as_deref()),
        }
    }
    debug!(%peer, "receiver thread exiting");
}
