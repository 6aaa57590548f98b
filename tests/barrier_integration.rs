//! Barrier rendezvous over real loopback clusters.

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::run_cluster;
use pbsm::SiteId;

#[test]
fn nobody_passes_before_everyone_enters() {
    const SITE: SiteId = 0x501;
    const ROUNDS: usize = 10;
    const NODES: usize = 3;

    let entered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&entered);
    run_cluster(NODES, 40100, move |node| {
        for round in 1..=ROUNDS {
            counter.fetch_add(1, Ordering::SeqCst);
            node.barrier(SITE);
            // All entries of this round happen before any node resumes.
            assert!(counter.load(Ordering::SeqCst) >= NODES * round);
        }
    });
    assert_eq!(entered.load(Ordering::SeqCst), NODES * ROUNDS);
}

#[test]
fn rapid_reuse_of_one_site() {
    const SITE: SiteId = 0x511;

    run_cluster(2, 40110, |node| {
        for _ in 0..50 {
            node.barrier(SITE);
        }
    });
}

#[test]
fn staggered_entry_still_rendezvouses() {
    const EARLY: SiteId = 0x521;
    const LATE: SiteId = 0x522;

    run_cluster(3, 40120, |node| {
        // Vary who shows up last, coordinator included.
        thread::sleep(Duration::from_millis(30 * node.self_id().0));
        node.barrier(EARLY);
        thread::sleep(Duration::from_millis(30 * (2 - node.self_id().0)));
        node.barrier(LATE);
    });
}

#[test]
fn distinct_sites_are_independent_rounds() {
    const FIRST: SiteId = 0x531;
    const SECOND: SiteId = 0x532;

    run_cluster(2, 40130, |node| {
        node.barrier(FIRST);
        node.barrier(SECOND);
        node.barrier(FIRST);
    });
}
