//! Shared helpers for standing up in-process clusters on loopback.
//!
//! Each test gets its own base port so test binaries can run in parallel
//! without colliding; keep the bases unique across every integration test.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;

use pbsm::ClusterConfig;
use pbsm::Node;

/// Run `body` once per node of an `n`-node loopback cluster, each node on
/// its own thread, and collect the per-node results indexed by node id.
///
/// A panic in any node's body fails the test after the others are joined.
#[allow(dead_code)]
pub fn run_cluster_with<T, F>(n: usize, base_port: u16, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Node) -> T + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let peers: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(); n];
    let handles: Vec<_> = (0..n as u64)
        .map(|index| {
            let config = ClusterConfig::new(peers.clone(), base_port);
            let body = Arc::clone(&body);
            thread::Builder::new()
                .name(format!("node-{index}"))
                .spawn(move || {
                    let node = Node::bootstrap(&config, index).expect("node bootstrap");
                    body(node)
                })
                .expect("spawning node thread")
        })
        .collect();
    let mut results = Vec::with_capacity(n);
    for handle in handles {
        results.push(handle.join().expect("node thread panicked"));
    }
    results
}

/// [`run_cluster_with`] for bodies without a result.
#[allow(dead_code)]
pub fn run_cluster<F>(n: usize, base_port: u16, body: F)
where
    F: Fn(Node) + Send + Sync + 'static,
{
    run_cluster_with(n, base_port, body);
}
