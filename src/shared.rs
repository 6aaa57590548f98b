//! `Shared<T>`: the accessor handle over the coherence façade.
//!
//! A `Shared` ties a plain-old-data value to a site id and routes every
//! access through the runtime: `get` waits until the local copy is current,
//! `set` waits until this node holds the variable exclusively, `update`
//! does a read-modify-write as one step. The record inside the runtime
//! owns the authoritative byte buffer; the handle just copies values in
//! and out of it.
//!
//! The handle carries its own accessor lock, held across each operation's
//! body. The runtime's record lock covers only its own metadata and the
//! payload buffer, so without this lock two local threads interleaving
//! `update`s could lose increments to each other.
//!
//! Dropping the handle tears the variable down, broadcasting the last
//! local bytes so peers whose handles are still live observe the final
//! value. Handles for the same variable are expected to be dropped at
//! corresponding points on all nodes; there is no cross-node consensus on
//! destruction.

use std::marker::PhantomData;

use bytemuck::Pod;
use bytemuck::Zeroable;
use parking_lot::Mutex;
use tracing::warn;

use crate::node::Node;
use crate::site::SiteId;

/// A distributed shared variable of fixed-size value type `T`.
///
/// ```
/// use pbsm::config::ClusterConfig;
/// use pbsm::node::Node;
/// use pbsm::shared::Shared;
///
/// let config = ClusterConfig::new(vec!["127.0.0.1".parse().unwrap()], 2000);
/// let node = Node::bootstrap(&config, 0).unwrap();
///
/// let counter = Shared::new(&node, pbsm::site_id!(), 0u64);
/// counter.update(|v| v + 1);
/// assert_eq!(counter.get(), 1);
/// ```
pub struct Shared<'node, T: Pod> {
    node: &'node Node,
    id: SiteId,
    /// Serializes local accessors against each other; see the module docs.
    accessor: Mutex<()>,
    _value: PhantomData<T>,
}

impl<'node, T: Pod> Shared<'node, T> {
    /// Declare the variable at `id` with an initial value.
    ///
    /// Every node must declare the same variable with the same value type.
    /// On non-coordinator nodes `initial` seeds the local cache; the
    /// coordinator's copy is the authoritative one until ownership moves.
    pub fn new(node: &'node Node, id: SiteId, initial: T) -> Self {
        node.on_create(id, bytemuck::bytes_of(&initial));
        Self {
            node,
            id,
            accessor: Mutex::new(()),
            _value: PhantomData,
        }
    }

    /// The variable's site id.
    pub fn id(&self) -> SiteId {
        self.id
    }

    /// Read the current value, fetching it from the owner if the local
    /// copy is stale. Blocks until the value is current.
    pub fn get(&self) -> T {
        let _local = self.accessor.lock();
        self.node.before_read(self.id);
        let mut value = T::zeroed();
        self.node.copy_payload_to(self.id, bytemuck::bytes_of_mut(&mut value));
        value
    }

    /// Overwrite the value. Blocks until this node holds the variable
    /// exclusively.
    pub fn set(&self, value: T) {
        let _local = self.accessor.lock();
        self.node.before_write(self.id);
        self.node.copy_payload_from(self.id, bytemuck::bytes_of(&value));
        self.node.after_write(self.id);
    }

    /// Apply `f` to the current local value and store the result,
    /// returning it.
    ///
    /// The whole step runs inside one write span with the accessor lock
    /// held, so concurrent local `update`s never lose increments to each
    /// other and remote peers observe either the old value or the result,
    /// never the base of an in-flight computation. The base is this node's
    /// local copy at the moment ownership is held; it is not re-fetched
    /// from a previous owner first.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let _local = self.accessor.lock();
        self.node.before_write(self.id);
        let mut current = T::zeroed();
        self.node.copy_payload_to(self.id, bytemuck::bytes_of_mut(&mut current));
        let next = f(current);
        self.node.copy_payload_from(self.id, bytemuck::bytes_of(&next));
        self.node.after_write(self.id);
        next
    }
}

impl<T: Pod> Drop for Shared<'_, T> {
    fn drop(&mut self) {
        // The last local bytes go out as-is; the destructor does not chase
        // a fresher copy from the owner.
        let _local = self.accessor.lock();
        let mut value = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut value);
        if !self.node.copy_payload_to(self.id, bytes) {
            return;
        }
        if let Err(err) = self.node.on_destroy(self.id, bytes) {
            warn!(var_id = self.id, error = %err, "final value broadcast failed on drop");
        }
    }
}
