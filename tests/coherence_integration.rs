//! End-to-end coherence scenarios over real loopback clusters.
//!
//! Every test stands up N in-process nodes, each with its own receiver
//! threads and TCP mesh, and drives them through a scripted interleaving.
//! Barriers separate the phases so the asserted states are deterministic.

mod common;

use std::thread;

use common::run_cluster;
use common::run_cluster_with;
use pbsm::CoherenceState;
use pbsm::Shared;
use pbsm::SiteId;

#[test]
fn alternating_writers_count_to_ten() {
    const COUNTER: SiteId = 0xA1;
    const START: SiteId = 0xA2;
    const DONE: SiteId = 0xA3;

    run_cluster(2, 40000, |node| {
        let counter = Shared::new(&node, COUNTER, 0u64);
        node.barrier(START);
        loop {
            let value = counter.get();
            if value >= 10 {
                break;
            }
            let my_turn = if node.is_coordinator() {
                value % 2 == 0
            } else {
                value % 2 == 1
            };
            if my_turn {
                counter.update(|v| v + 1);
            } else {
                thread::yield_now();
            }
        }
        node.barrier(DONE);
        assert_eq!(counter.get(), 10);
    });
}

#[test]
fn read_after_write_fetches_from_owner() {
    const VAR: SiteId = 0xB1;
    const CREATED: SiteId = 0xB2;
    const WRITTEN: SiteId = 0xB3;
    const CHECKED: SiteId = 0xB4;

    run_cluster(3, 40010, |node| {
        let a = Shared::new(&node, VAR, 0u32);
        node.barrier(CREATED);
        if node.is_coordinator() {
            a.set(7);
        }
        node.barrier(WRITTEN);
        if !node.is_coordinator() {
            // The coordinator's write invalidated this cache; the read must
            // fetch and revalidate it.
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::RemoteStale));
            assert_eq!(a.get(), 7);
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::RemoteCached));
        }
        node.barrier(CHECKED);
    });
}

#[test]
fn invalidation_fans_out_to_every_cache() {
    const VAR: SiteId = 0xC1;
    const CREATED: SiteId = 0xC2;
    const FIRST_WRITE: SiteId = 0xC3;
    const CACHED: SiteId = 0xC4;
    const SECOND_WRITE: SiteId = 0xC5;
    const CHECKED: SiteId = 0xC6;

    run_cluster(4, 40020, |node| {
        let a = Shared::new(&node, VAR, 0u64);
        node.barrier(CREATED);
        if node.is_coordinator() {
            a.set(1);
        }
        node.barrier(FIRST_WRITE);
        if !node.is_coordinator() {
            assert_eq!(a.get(), 1);
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::RemoteCached));
        }
        node.barrier(CACHED);
        if node.is_coordinator() {
            // Serving three caches put the owner in the shared state; this
            // write must invalidate all three and drain their acks.
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::OwnerShared));
            a.set(2);
            assert_eq!(
                node.coherence_state(VAR),
                Some(CoherenceState::OwnerExclusive)
            );
        }
        node.barrier(SECOND_WRITE);
        if !node.is_coordinator() {
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::RemoteStale));
            assert_eq!(a.get(), 2);
        }
        node.barrier(CHECKED);
    });
}

#[test]
fn ownership_chases_stale_hints() {
    const VAR: SiteId = 0xD1;
    const CREATED: SiteId = 0xD2;
    const W0: SiteId = 0xD3;
    const W1: SiteId = 0xD4;
    const W2: SiteId = 0xD5;
    const READ: SiteId = 0xD6;
    const CHECKED: SiteId = 0xD7;

    run_cluster(3, 40030, |node| {
        let a = Shared::new(&node, VAR, 0u64);
        node.barrier(CREATED);
        if node.is_coordinator() {
            a.set(1);
        }
        node.barrier(W0);
        if node.self_id().0 == 1 {
            a.set(2);
        }
        node.barrier(W1);
        if node.self_id().0 == 2 {
            // The coordinator's hint still points at node 1's predecessor
            // chain; the request has to be redirected before the grant.
            a.set(3);
            assert_eq!(
                node.coherence_state(VAR),
                Some(CoherenceState::OwnerExclusive)
            );
        }
        node.barrier(W2);
        // Every node converges on the last written value; stale hints are
        // chased through SET_OWNER redirects on the read path too.
        assert_eq!(a.get(), 3);
        node.barrier(READ);
        let state = node.coherence_state(VAR).unwrap();
        if node.self_id().0 == 2 {
            assert!(state.is_owner());
        } else {
            assert_eq!(state, CoherenceState::RemoteCached);
        }
        node.barrier(CHECKED);
    });
}

#[test]
fn concurrent_writers_converge_on_one_value() {
    const VAR: SiteId = 0xE1;
    const CREATED: SiteId = 0xE2;
    const WRITTEN: SiteId = 0xE3;
    const READ: SiteId = 0xE4;
    const CHECKED: SiteId = 0xE5;

    let results = run_cluster_with(3, 40040, |node| {
        let a = Shared::new(&node, VAR, 0u64);
        node.barrier(CREATED);
        if !node.is_coordinator() {
            a.set(node.self_id().0 * 100);
        }
        node.barrier(WRITTEN);
        let value = a.get();
        node.barrier(READ);
        let owner = node.coherence_state(VAR).unwrap().is_owner();
        node.barrier(CHECKED);
        (value, owner)
    });

    let value = results[0].0;
    assert!(value == 100 || value == 200, "unexpected value {value}");
    assert!(results.iter().all(|(v, _)| *v == value));
    assert_eq!(results.iter().filter(|(_, owner)| *owner).count(), 1);
}

#[test]
fn destroy_broadcasts_the_final_value() {
    const VAR: SiteId = 0xF1;
    const CREATED: SiteId = 0xF2;
    const DESTROYED: SiteId = 0xF3;
    const CHECKED: SiteId = 0xF4;

    run_cluster(2, 40050, |node| {
        if node.is_coordinator() {
            {
                let a = Shared::new(&node, VAR, 0u64);
                node.barrier(CREATED);
                a.set(42);
            }
            node.barrier(DESTROYED);
            node.barrier(CHECKED);
        } else {
            let a = Shared::new(&node, VAR, 0u64);
            node.barrier(CREATED);
            node.barrier(DESTROYED);
            // The teardown broadcast both delivered the final value and
            // revalidated this cache, so the read is local.
            assert_eq!(node.coherence_state(VAR), Some(CoherenceState::RemoteCached));
            assert_eq!(a.get(), 42);
            node.barrier(CHECKED);
        }
    });
}

#[test]
fn write_storm_terminates() {
    const VAR: SiteId = 0x101;
    const CREATED: SiteId = 0x102;
    const STORMED: SiteId = 0x103;
    const CHECKED: SiteId = 0x104;
    const THREADS: usize = 4;
    const ROUNDS: u64 = 25;

    run_cluster(2, 40060, |node| {
        let a = Shared::new(&node, VAR, 0u64);
        node.barrier(CREATED);
        // Contended increments from several local threads while the peer
        // does the same. Local threads are serialized by the handle's
        // accessor lock; across nodes an update may still rebase on a copy
        // that predates the peer's latest writes, so increments can be
        // lost cluster-wide. Every operation must terminate and the
        // cluster must stay coherent.
        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        a.update(|value| value + 1);
                    }
                });
            }
        });
        node.barrier(STORMED);
        let final_value = a.get();
        assert!(final_value >= 1);
        assert!(final_value <= 2 * THREADS as u64 * ROUNDS);
        node.barrier(CHECKED);
    });
}
