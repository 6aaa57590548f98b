//! TCP mesh transport.
//!
//! Every ordered pair of nodes gets a dedicated TCP connection: node `i`
//! dials node `j`'s listener (port `base_port + j`) and uses that connection
//! exclusively for `i → j` traffic, so each direction is a FIFO byte stream.
//! The dialer opens with an 8-byte little-endian hello carrying its node id,
//! which is how the acceptor indexes the inbound channel.
//!
//! Sends to one destination are serialized by a per-peer mutex; a paired
//! send (header then payload) holds the mutex across both writes so the two
//! buffers land contiguously. There is no serialization across different
//! destinations.
//!
//! Transport failures are not recoverable: there is no reconnect and no
//! backoff. Callers on the protocol's hot paths escalate through the
//! crate-internal `fatal` helper, which logs and terminates the process.

use std::io::Read;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::config::ClusterConfig;
use crate::config::NodeId;
use crate::wire::Header;

/// Length of the hello exchanged when a connection is dialed.
const HELLO_LEN: usize = 8;

/// How long bootstrap keeps retrying dials and waiting for inbound peers.
const MESH_DEADLINE: Duration = Duration::from_secs(15);

/// Pause between dial retries while a peer's listener is not up yet.
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors raised by the mesh transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding the local listener failed.
    #[error("binding mesh listener on {addr} failed: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// Accepting an inbound connection failed.
    #[error("accepting a mesh connection failed: {source}")]
    Accept {
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// Not every peer dialed in before the bootstrap deadline.
    #[error("timed out waiting for {missing} inbound peer connection(s)")]
    AcceptTimeout {
        /// Peers still unaccounted for.
        missing: usize,
    },

    /// Dialing a peer kept failing until the bootstrap deadline.
    #[error("dialing node {peer} at {addr} failed: {source}")]
    Dial {
        /// The peer being dialed.
        peer: NodeId,
        /// Its listen address.
        addr: SocketAddr,
        /// Last socket error observed.
        source: std::io::Error,
    },

    /// The hello exchange on a fresh connection failed.
    #[error("hello exchange failed: {source}")]
    Hello {
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// An inbound hello named a node id outside the cluster, our own id,
    /// or a peer that already connected.
    #[error("inbound connection announced unusable node id {peer}")]
    BadHello {
        /// The announced id.
        peer: u64,
    },

    /// A unicast named this node as destination.
    #[error("attempted to send to self")]
    SendToSelf,

    /// Writing to a peer failed or came up short.
    #[error("send to node {peer} failed: {source}")]
    Send {
        /// Destination peer.
        peer: NodeId,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// Reading from a peer failed.
    #[error("receive from node {peer} failed: {source}")]
    Recv {
        /// Source peer.
        peer: NodeId,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// A peer's channel closed in the middle of a message.
    #[error("channel from node {peer} closed mid-message")]
    ChannelClosed {
        /// Source peer.
        peer: NodeId,
    },

    /// One or more destinations of a broadcast failed; the rest were sent.
    #[error("broadcast failed for peers {failed:?}")]
    BroadcastFailed {
        /// Peers whose send failed.
        failed: Vec<NodeId>,
    },
}

/// Log a transport failure and terminate the process.
///
/// A dead channel means a dead peer, and a dead peer aborts the whole
/// system; surviving peers notice on their next send and do the same.
pub(crate) fn fatal(err: &TransportError) -> ! {
    error!(error = %err, "fatal transport failure, aborting");
    std::process::exit(1);
}

/// Outbound half of one peer pair.
struct PeerSender {
    peer: NodeId,
    stream: Mutex<TcpStream>,
}

/// The inbound half of one peer pair, owned by that peer's receiver thread.
pub struct PeerReceiver {
    peer: NodeId,
    stream: TcpStream,
}

impl PeerReceiver {
    /// The peer this channel receives from.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    /// Block until `buf` is filled with bytes from this peer.
    ///
    /// Returns `Ok(false)` if the channel closed cleanly before the first
    /// byte (the peer shut down at a message boundary). A close after a
    /// partial fill is a hard error.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<bool, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(TransportError::ChannelClosed { peer: self.peer }),
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(TransportError::Recv {
                        peer: self.peer,
                        source,
                    });
                }
            }
        }
        Ok(true)
    }
}

/// The full mesh: one outbound channel per remote peer, plus shutdown
/// plumbing for the inbound side.
pub struct Transport {
    self_id: NodeId,
    cluster_size: usize,
    senders: Vec<Option<PeerSender>>,
    shutting_down: AtomicBool,
    recv_handles: Mutex<Vec<TcpStream>>,
}

impl Transport {
    /// Establish the mesh: bind the local listener, dial every peer, and
    /// wait for every peer to dial in.
    ///
    /// Returns the transport plus one [`PeerReceiver`] per remote peer, in
    /// no particular order. For a single-node cluster the receiver list is
    /// empty and no sockets are opened.
    pub fn connect(
        config: &ClusterConfig,
        self_id: NodeId,
    ) -> Result<(Transport, Vec<PeerReceiver>), TransportError> {
        let cluster_size = config.cluster_size();
        let mut transport = Transport {
            self_id,
            cluster_size,
            senders: (0..cluster_size).map(|_| None).collect(),
            shutting_down: AtomicBool::new(false),
            recv_handles: Mutex::new(Vec::new()),
        };
        if cluster_size == 1 {
            return Ok((transport, Vec::new()));
        }

        let listen_addr = wildcard(config.listen_addr_of(self_id));
        let listener = TcpListener::bind(listen_addr).map_err(|source| TransportError::Bind {
            addr: listen_addr,
            source,
        })?;
        debug!(node = %self_id, addr = %listen_addr, "mesh listener bound");

        let expected = cluster_size - 1;
        let acceptor = thread::Builder::new()
            .name("pbsm-accept".into())
            .spawn(move || accept_peers(listener, self_id, cluster_size, expected))
            .expect("spawning acceptor thread");

        let mut dial_error = None;
        for peer in config.remote_peers(self_id) {
            let addr = config.listen_addr_of(peer);
            match dial_peer(self_id, peer, addr) {
                Ok(sender) => transport.senders[peer.index()] = Some(sender),
                Err(err) => {
                    dial_error = Some(err);
                    break;
                }
            }
        }

        let accepted = acceptor.join().expect("acceptor thread panicked");
        if let Some(err) = dial_error {
            return Err(err);
        }
        let accepted = accepted?;

        let mut receivers = Vec::with_capacity(expected);
        {
            let mut handles = transport.recv_handles.lock();
            for (peer, stream) in accepted {
                if let Ok(clone) = stream.try_clone() {
                    handles.push(clone);
                }
                receivers.push(PeerReceiver { peer, stream });
            }
        }
        debug!(node = %self_id, peers = expected, "mesh established");
        Ok((transport, receivers))
    }

    /// This node's id.
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Total number of nodes, including this one.
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Whether [`Transport::begin_shutdown`] has run.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Close every channel. Receiver threads blocked in `recv_exact` wake
    /// with a clean close. Idempotent.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for sender in self.senders.iter().flatten() {
            let stream = sender.stream.lock();
            let _ = stream.shutdown(Shutdown::Both);
        }
        for handle in self.recv_handles.lock().iter() {
            let _ = handle.shutdown(Shutdown::Both);
        }
    }

    fn sender(&self, dst: NodeId) -> Result<&PeerSender, TransportError> {
        if dst == self.self_id {
            return Err(TransportError::SendToSelf);
        }
        self.senders
            .get(dst.index())
            .and_then(Option::as_ref)
            .ok_or(TransportError::SendToSelf)
    }

    /// Send one header to `dst`, atomically with respect to other sends to
    /// the same destination.
    pub fn send(&self, dst: NodeId, header: &Header) -> Result<(), TransportError> {
        let sender = self.sender(dst)?;
        let mut stream = sender.stream.lock();
        stream
            .write_all(&header.encode())
            .map_err(|source| TransportError::Send { peer: dst, source })
    }

    /// Send a header immediately followed by a payload; no other message to
    /// `dst` can interleave between the two.
    pub fn send_pair(
        &self,
        dst: NodeId,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let sender = self.sender(dst)?;
        let mut stream = sender.stream.lock();
        stream
            .write_all(&header.encode())
            .and_then(|()| stream.write_all(payload))
            .map_err(|source| TransportError::Send { peer: dst, source })
    }

    /// Send one header to every remote peer. A failed destination does not
    /// stop the others; failures are reported in aggregate.
    pub fn broadcast(&self, header: &Header) -> Result<(), TransportError> {
        self.broadcast_with(|peer| self.send(peer, header))
    }

    /// Broadcast a header/payload pair to every remote peer.
    pub fn broadcast_pair(&self, header: &Header, payload: &[u8]) -> Result<(), TransportError> {
        self.broadcast_with(|peer| self.send_pair(peer, header, payload))
    }

    fn broadcast_with(
        &self,
        send_one: impl Fn(NodeId) -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        let mut failed = Vec::new();
        for sender in self.senders.iter().flatten() {
            if let Err(err) = send_one(sender.peer) {
                warn!(peer = %sender.peer, error = %err, "broadcast leg failed");
                failed.push(sender.peer);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(TransportError::BroadcastFailed { failed })
        }
    }
}

/// Listener port for any local interface of the same family.
fn wildcard(addr: SocketAddr) -> SocketAddr {
    let ip: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    SocketAddr::new(ip, addr.port())
}

fn dial_peer(
    self_id: NodeId,
    peer: NodeId,
    addr: SocketAddr,
) -> Result<PeerSender, TransportError> {
    let deadline = Instant::now() + MESH_DEADLINE;
    loop {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let _ = stream.set_nodelay(true);
                stream
                    .write_all(&self_id.0.to_le_bytes())
                    .map_err(|source| TransportError::Hello { source })?;
                debug!(node = %self_id, peer = %peer, %addr, "outbound channel up");
                return Ok(PeerSender {
                    peer,
                    stream: Mutex::new(stream),
                });
            }
            Err(source) => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Dial { peer, addr, source });
                }
                thread::sleep(DIAL_RETRY_DELAY);
            }
        }
    }
}

fn accept_peers(
    listener: TcpListener,
    self_id: NodeId,
    cluster_size: usize,
    expected: usize,
) -> Result<Vec<(NodeId, TcpStream)>, TransportError> {
    listener
        .set_nonblocking(true)
        .map_err(|source| TransportError::Accept { source })?;
    let deadline = Instant::now() + MESH_DEADLINE;
    let mut accepted: Vec<(NodeId, TcpStream)> = Vec::with_capacity(expected);
    while accepted.len() < expected {
        match listener.accept() {
            Ok((mut stream, _)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|source| TransportError::Accept { source })?;
                let _ = stream.set_nodelay(true);
                let mut hello = [0u8; HELLO_LEN];
                stream
                    .read_exact(&mut hello)
                    .map_err(|source| TransportError::Hello { source })?;
                let raw = u64::from_le_bytes(hello);
                let known = (raw as usize) < cluster_size && raw != self_id.0;
                let duplicate = accepted.iter().any(|(p, _)| p.0 == raw);
                if !known || duplicate {
                    return Err(TransportError::BadHello { peer: raw });
                }
                debug!(node = %self_id, peer = raw, "inbound channel up");
                accepted.push((NodeId(raw), stream));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransportError::AcceptTimeout {
                        missing: expected - accepted.len(),
                    });
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(source) => return Err(TransportError::Accept { source }),
        }
    }
    Ok(accepted)
}
