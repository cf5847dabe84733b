// End-to-end scenarios from spec.md §8 not already exercised by the unit
// tests alongside each state machine or by the demo binary (src/main.rs).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mds_locker::cache::{CacheExt, InMemoryCache};
use mds_locker::client::InMemoryClientRegistry;
use mds_locker::common::DnKey;
use mds_locker::config::LockerConfig;
use mds_locker::journal::InMemoryJournal;
use mds_locker::locker::{CapBits, Capability, Dentry, Disposition, DnLockState, Inode, Locker, MdRequest};
use mds_locker::transport::InMemoryTransport;

fn locker_with_keep_alive(
    node_id: mds_locker::common::NodeId,
    keep_alive: Duration,
) -> (Locker, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let locker = Locker::new(
        LockerConfig {
            node_id,
            replica_caps_keep_alive: keep_alive,
            ..LockerConfig::default()
        },
        Arc::new(InMemoryCache::new()),
        Arc::new(transport.clone()),
        Arc::new(InMemoryJournal::new()),
        Arc::new(InMemoryClientRegistry::new()),
    );
    (locker, transport)
}

fn locker(node_id: mds_locker::common::NodeId) -> Locker {
    locker_with_keep_alive(node_id, Duration::from_secs(2)).0
}

// Scenario 5: hysteresis on cap release. A replica's aggregate drops to
// zero, flaps back up before the keep-alive window expires, and no
// MInodeFileCaps traffic is sent for either edge.
#[tokio::test]
async fn hysteresis_suppresses_traffic_for_a_flap_within_the_keep_alive_window() {
    let (locker, transport) = locker_with_keep_alive(1, Duration::from_millis(50));
    let mut inode = Inode::new(1, 0);
    inode.replicas.insert(0);
    locker.cache.insert_inode(inode);

    // A local client opens for read: the replica's aggregate becomes RD and
    // is reported up to the authority once.
    locker.cache.with_inode_mut(1, |inode| {
        inode.client_caps.insert(9, Capability::new(CapBits::FILE_RD));
    });
    locker.request_inode_file_caps(1).await;
    assert_eq!(transport.drain().len(), 1);
    assert_eq!(
        locker.cache.inode(1).unwrap().replica_caps_wanted,
        CapBits::FILE_RD
    );

    // The client closes: aggregate drops to zero, but the keep-alive window
    // holds off reporting it.
    locker.cache.with_inode_mut(1, |inode| {
        inode.client_caps.remove(&9);
    });
    locker.request_inode_file_caps(1).await;
    assert!(
        transport.drain().is_empty(),
        "the drop to zero is held off for the keep-alive window, not reported immediately"
    );

    tokio::time::sleep(Duration::from_millis(10)).await;

    // Same client reopens for read before the window expires: aggregate
    // goes back to RD, exactly what the authority already has on file.
    locker.cache.with_inode_mut(1, |inode| {
        inode.client_caps.insert(9, Capability::new(CapBits::FILE_RD));
    });
    locker.request_inode_file_caps(1).await;

    assert!(
        transport.drain().is_empty(),
        "no MInodeFileCaps traffic should occur despite the flap"
    );
    assert_eq!(
        locker.cache.inode(1).unwrap().replica_caps_wanted,
        CapBits::FILE_RD
    );
}

// Scenario 6: deadlock avoidance in batched acquisition. Two requests both
// want d1 then d2 in canonical order; the loser suspends on d1 holding
// nothing, never on d2 waiting for the winner's d1.
#[tokio::test]
async fn two_requests_for_the_same_dentry_pair_never_deadlock() {
    let locker = locker(0);
    let d1 = DnKey::new(1, "a".to_string());
    let d2 = DnKey::new(1, "b".to_string());
    locker.cache.insert_dentry(Dentry::new(d1.clone(), 0));
    locker.cache.insert_dentry(Dentry::new(d2.clone(), 0));

    let mut winner = MdRequest::new(1);
    let winner_disposition = locker
        .acquire_locks(
            &mut winner,
            BTreeSet::new(),
            BTreeSet::from([d1.clone(), d2.clone()]),
            BTreeSet::new(),
            BTreeSet::new(),
            |_| None,
            Arc::new(|| {}),
        )
        .await;
    assert_eq!(winner_disposition, Disposition::Ready);
    assert!(winner.dentry_xlocks.contains(&d1));
    assert!(winner.dentry_xlocks.contains(&d2));

    let mut loser = MdRequest::new(2);
    let loser_disposition = locker
        .acquire_locks(
            &mut loser,
            BTreeSet::new(),
            BTreeSet::from([d1.clone(), d2.clone()]),
            BTreeSet::new(),
            BTreeSet::new(),
            |_| None,
            Arc::new(|| {}),
        )
        .await;
    assert_eq!(loser_disposition, Disposition::Suspended);
    assert!(loser.dentry_xlocks.is_empty());
    assert!(loser.auth_pins.is_empty());

    locker.drop_all_locks(&mut winner).await;
    assert_eq!(locker.cache.dentry(&d1).unwrap().state, DnLockState::Sync);
    assert_eq!(locker.cache.dentry(&d2).unwrap().state, DnLockState::Sync);
}
