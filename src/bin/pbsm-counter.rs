//! Alternating-counter demo.
//!
//! Every node declares the same shared counter, then the cluster counts to
//! a target cooperatively: the coordinator increments on even values, any
//! other node increments on odd ones. Ownership of the counter ping-pongs
//! between the writers, so a two-node run exercises the full migration
//! path: invalidation, fetch, request, grant.
//!
//! Run one instance per hosts-file entry:
//!
//! ```bash
//! pbsm-counter 0   # on the coordinator
//! pbsm-counter 1   # on the second node
//! ```

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pbsm::ClusterConfig;
use pbsm::Node;
use pbsm::Shared;

/// Counter value at which every node stops.
const TARGET: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "pbsm-counter", about = "Cooperative counting over shared memory")]
struct Args {
    /// Index of this node in the hosts file (0 is the coordinator).
    node_index: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let config = ClusterConfig::load().context("loading cluster configuration")?;
    let node = Node::bootstrap(&config, args.node_index).context("joining the cluster")?;

    let counter = Shared::new(&node, pbsm::site_id!(), 0u64);
    node.barrier(pbsm::site_id!());

    loop {
        let value = counter.get();
        if value >= TARGET {
            break;
        }
        let my_turn = node.cluster_size() == 1
            || if node.is_coordinator() {
                value % 2 == 0
            } else {
                value % 2 == 1
            };
        if my_turn {
            let next = counter.update(|v| v + 1);
            println!("node {} advanced the counter to {next}", node.self_id());
        }
    }

    node.barrier(pbsm::site_id!());
    println!("node {} done, counter = {}", node.self_id(), counter.get());
    drop(counter);
    node.shutdown();
    Ok(())
}
