//! Integration test: health checks with verify caps, client lease renewal,
//! and what the collector does to objects nobody renews.

mod common;

use common::{payload, Cluster, GRACE_SECS, LEASE_SECS};
use tessera_core::{GridError, ObjectKind, ShareId};
use tessera_storage::{Clock, StorageNode};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn check_reports_live_corrupt_and_unreachable() {
    let cluster = Cluster::new(10);
    let grid = cluster.grid(3, 10);
    let cap = grid.upload(&payload("checked", 100_000)).await.unwrap();
    let verify = cap.to_verify_cap().unwrap();

    let report = grid.check(&verify).await.unwrap();
    assert_eq!(report.live_shares, 10);
    assert!(report.is_healthy());
    assert!(report.missing().is_empty());
    assert_eq!(report.locations.len(), 10);

    let si = cap.storage_index().unwrap();
    let holders = cluster.holders(&si, ObjectKind::Immutable);
    holders[0].set_corrupt(true);
    holders[1].set_corrupt(true);
    holders[2].set_down(true);

    let report = grid.check(&verify).await.unwrap();
    assert_eq!(report.live_shares, 7);
    assert_eq!(report.corrupt.len(), 2);
    assert_eq!(report.unreachable, vec![holders[2].peer_id()]);
    assert_eq!(report.missing().len(), 3);
    assert!(report.is_recoverable());
    assert!(!report.is_healthy());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["live_shares"], 7);
}

#[tokio::test]
async fn check_mutable_reports_newest_version() {
    let cluster = Cluster::new(6);
    let grid = cluster.grid(2, 6);
    let cap = grid.create_mutable(b"v1").await.unwrap();
    grid.update(&cap, b"v2").await.unwrap();

    let report = grid.check(&cap.to_verify_cap().unwrap()).await.unwrap();
    assert_eq!(report.kind, ObjectKind::Mutable);
    assert_eq!(report.version, Some(2));
    assert_eq!(report.live_shares, 6);
    assert!(report.is_healthy());
}

#[tokio::test]
async fn renewed_objects_outlive_the_collector() {
    let cluster = Cluster::new(5);
    let grid = cluster.grid(2, 5);
    let data = payload("kept alive", 30_000);
    let cap = grid.upload(&data).await.unwrap();

    cluster.clock.advance(LEASE_SECS - 10);
    let renewal = grid.renew_leases(&cap).await.unwrap();
    assert_eq!(renewal.renewed, 5);
    assert!(renewal.missing.is_empty());
    assert!(renewal.lost.is_empty());
    assert_eq!(renewal.expires_at, Some(cluster.clock.now() + LEASE_SECS));

    // Past the original expiry plus grace, but inside the renewed lease.
    cluster.clock.advance(GRACE_SECS + 20);
    assert_eq!(cluster.sweep().await, 0);
    assert_eq!(grid.download(&cap, &CancellationToken::new()).await.unwrap(), data);
}

#[tokio::test]
async fn unrenewed_objects_are_collected_once() {
    let cluster = Cluster::new(5);
    let grid = cluster.grid(2, 5);
    let cap = grid.upload(&payload("forgotten", 30_000)).await.unwrap();
    let si = cap.storage_index().unwrap();

    // Expired but still inside the grace period: kept.
    cluster.clock.advance(LEASE_SECS + GRACE_SECS - 1);
    assert_eq!(cluster.sweep().await, 0);

    cluster.clock.advance(1);
    assert_eq!(cluster.sweep().await, 5);
    assert_eq!(cluster.sweep().await, 0, "each share reclaimed exactly once");

    // Too late: the nodes no longer know the shares.
    let owner = grid.options().lease_secret.lease_owner(&si);
    let err = cluster.nodes[0]
        .renew_lease(ShareId::new(si, 0), owner)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::ShareNotFound(_)));

    let renewal = grid.renew_leases(&cap).await.unwrap();
    assert_eq!(renewal.renewed, 0);
    assert_eq!(renewal.missing.len(), 5);

    let err = grid.download(&cap, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, GridError::InsufficientShares { have: 0, need: 2 }));

    // Re-placing brings it back.
    grid.upload(&payload("forgotten", 30_000)).await.unwrap();
    assert_eq!(grid.check(&cap).await.unwrap().live_shares, 5);
}

#[tokio::test]
async fn renewal_by_a_stranger_is_refused() {
    let cluster = Cluster::new(4);
    let grid = cluster.grid(2, 4);
    let cap = grid.upload(b"mine").await.unwrap();

    let stranger = tessera_grid::Grid::new(
        cluster.peers(),
        cluster
            .options(2, 4)
            .with_lease_secret(tessera_crypto::LeaseSecret::from_bytes([0xEE; 32])),
    );
    let renewal = stranger.renew_leases(&cap).await.unwrap();
    assert_eq!(renewal.renewed, 0);
    assert_eq!(renewal.lost.len(), 4);
}

#[tokio::test]
async fn mutable_leases_renew_too() {
    let cluster = Cluster::new(4);
    let grid = cluster.grid(2, 4);
    let cap = grid.create_mutable(b"slot").await.unwrap();
    let renewal = grid.renew_leases(&cap.to_verify_cap().unwrap()).await.unwrap();
    assert_eq!(renewal.renewed, 4);
    assert!(renewal.missing.is_empty());
}
