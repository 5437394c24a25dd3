//! Concurrent churn against one manager: after every handle is released,
//! every scope's usage must return to zero and the registry must drain.

use std::sync::atomic::{AtomicU64, Ordering};

use veles::common::id::{PeerId, ProtocolId};
use veles::config::types::{BaseLimit, LimitConfig};
use veles::manager::{ManagerStat, ResourceManager};
use veles::scope::account::{Direction, PRIORITY_HIGH};

fn churn_limits() -> LimitConfig {
    LimitConfig {
        system: BaseLimit {
            memory: 1 << 24,
            streams_inbound: 512,
            streams_outbound: 512,
            streams: 1024,
            conns_inbound: 512,
            conns_outbound: 512,
            conns: 1024,
            fd: 256,
        },
        transient: BaseLimit {
            memory: 1 << 22,
            streams_inbound: 16,
            streams_outbound: 16,
            streams: 32,
            conns_inbound: 16,
            conns_outbound: 16,
            conns: 32,
            fd: 16,
        },
        peer_default: BaseLimit {
            memory: 1 << 22,
            streams_inbound: 64,
            streams_outbound: 64,
            streams: 128,
            conns_inbound: 16,
            conns_outbound: 16,
            conns: 32,
            fd: 8,
        },
        ..LimitConfig::default()
    }
}

#[test]
fn test_concurrent_churn_leaves_no_residue() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mgr = ResourceManager::new(churn_limits());
    let granted = AtomicU64::new(0);
    let refused = AtomicU64::new(0);

    std::thread::scope(|scope| {
        for t in 0..8usize {
            let mgr = &mgr;
            let granted = &granted;
            let refused = &refused;
            scope.spawn(move || {
                let proto = ProtocolId::from("/churn/1");
                for i in 0..200usize {
                    let p = PeerId::from(format!("peer-{}", (t + i) % 5));
                    match mgr.open_stream(&p, Direction::Inbound) {
                        Ok(stream) => {
                            granted.fetch_add(1, Ordering::Relaxed);
                            // attachment may trip per-peer or protocol
                            // limits under contention; both outcomes are
                            // fine as long as accounting stays balanced
                            let _ = stream.set_protocol(&proto);
                            if stream.reserve_memory(256, PRIORITY_HIGH).is_ok() {
                                stream.release_memory(256);
                            }
                            stream.done();
                        }
                        Err(e) => {
                            assert!(e.is_limit(), "unexpected error: {}", e);
                            refused.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if i % 17 == 0 {
                        mgr.gc();
                    }
                }
            });
        }
    });

    assert!(granted.load(Ordering::Relaxed) > 0);

    // every charge must have been returned
    mgr.view_system(|s| assert!(s.stat().is_zero())).unwrap();
    mgr.view_transient(|s| assert!(s.stat().is_zero())).unwrap();
    for i in 0..5 {
        let p = PeerId::from(format!("peer-{}", i));
        mgr.view_peer(&p, |s| assert!(s.stat().is_zero())).unwrap();
    }

    mgr.gc();
    assert_eq!(mgr.stat(), ManagerStat::default());

    // and the roots return to their baseline references
    mgr.view_system(|s| assert_eq!(s.ref_count(), 2)).unwrap();
    mgr.view_transient(|s| assert_eq!(s.ref_count(), 1)).unwrap();

    mgr.close();
}

#[test]
fn test_dropped_handles_release_their_charge() {
    let mgr = ResourceManager::new(churn_limits());

    {
        let stream = mgr
            .open_stream(&PeerId::from("peer-drop"), Direction::Inbound)
            .unwrap();
        stream.reserve_memory(1024, PRIORITY_HIGH).unwrap();
        // dropped without an explicit done
    }

    mgr.view_system(|s| assert!(s.stat().is_zero())).unwrap();
    mgr.gc();
    assert_eq!(mgr.stat(), ManagerStat::default());
    mgr.close();
}
