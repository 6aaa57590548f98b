//! Barrier smoke demo.
//!
//! Every node runs the same fixed sequence of rendezvous at one site,
//! printing as it passes each round. With staggered start-ups this makes
//! the lockstep visible: nobody prints round `n + 1` before every node has
//! printed round `n`.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pbsm::ClusterConfig;
use pbsm::Node;

/// Number of rendezvous rounds to run.
const ROUNDS: u32 = 5;

#[derive(Debug, Parser)]
#[command(name = "pbsm-barrier", about = "Lockstep barrier rounds across the cluster")]
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

    let site = pbsm::site_id!();
    for round in 1..=ROUNDS {
        node.barrier(site);
        println!("node {} passed barrier round {round}", node.self_id());
    }

    node.shutdown();
    Ok(())
}
