//! Proxy-based shared memory: the illusion of shared variables across a
//! fixed set of networked peer processes.
//!
//! Each process in the cluster is a [`Node`]. Applications declare
//! variables bound to stable source-site identifiers ([`site_id!`]) and
//! access them through [`Shared`] handles; the runtime intercepts every
//! read and write, fetching current values and migrating write ownership
//! between nodes so that each observed value is globally consistent at the
//! moment of access. [`Node::barrier`] gives cluster-wide rendezvous.
//!
//! The coherence protocol keeps a single writer per variable: one node
//! owns each variable at any time, readers hold invalidatable caches, and
//! ownership follows the writers. Node 0 (the coordinator) starts as the
//! owner of every variable and serializes barriers.
//!
//! Membership is fixed at startup from a hosts file, one IP per line; a
//! failed node aborts the whole system. See [`config`] for the file format
//! and [`wire`] for the message ABI.

#![warn(missing_docs)]

mod barrier;
pub mod config;
mod engine;
pub mod node;
pub mod registry;
pub mod shared;
pub mod site;
pub mod transport;
pub mod wire;

pub use config::ClusterConfig;
pub use config::NodeId;
pub use node::Node;
pub use node::NodeError;
pub use registry::CoherenceState;
pub use shared::Shared;
pub use site::SiteId;
