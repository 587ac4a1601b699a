//! Integration test: signed mutable objects, version ordering at peers,
//! and uncoordinated writers.

mod common;

use common::{payload, Cluster};
use tessera_core::{GridError, ObjectKind};
use tessera_crypto::Capability;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn create_update_read() {
    let cluster = Cluster::new(10);
    let grid = cluster.grid(3, 10);

    let cap = grid.create_mutable(b"first draft").await.unwrap();
    assert!(cap.is_write());
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), b"first draft");

    let v = grid.update(&cap, b"second draft").await.unwrap();
    assert_eq!(v, 2);
    let read_cap = cap.to_read_cap().unwrap();
    assert_eq!(grid.read_mutable(&read_cap).await.unwrap(), b"second draft");
    assert_eq!(grid.latest_version(&cap).await.unwrap(), 2);

    // download() dispatches mutable caps too
    let via_download = grid.download(&read_cap, &CancellationToken::new()).await.unwrap();
    assert_eq!(via_download, b"second draft");
}

#[tokio::test]
async fn lower_version_writer_gets_write_conflict() {
    let cluster = Cluster::new(10);
    let grid = cluster.grid(3, 10);
    let cap = grid.create_mutable(b"v1").await.unwrap();

    grid.publish(&cap, b"seven", 7).await.unwrap();
    let err = grid.publish(&cap, b"five", 5).await.unwrap_err();
    match err {
        GridError::WriteConflict {
            version,
            accepted,
            needed,
        } => {
            assert_eq!(version, 5);
            assert_eq!(accepted, 0);
            assert_eq!(needed, 6);
        }
        other => panic!("expected WriteConflict, got {other:?}"),
    }

    // Equal versions are refused too
    assert!(matches!(
        grid.publish(&cap, b"seven again", 7).await,
        Err(GridError::WriteConflict { .. })
    ));
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), b"seven");
}

#[tokio::test]
async fn racing_writers_resolve_per_peer() {
    let cluster = Cluster::new(10);
    let grid = cluster.grid(3, 10);
    let cap = grid.create_mutable(b"base").await.unwrap();

    let (a, b) = tokio::join!(
        grid.publish(&cap, b"writer a", 2),
        grid.publish(&cap, b"writer b", 2)
    );
    assert!(!(a.is_ok() && b.is_ok()), "both writers cannot reach quorum");
    for result in [&a, &b] {
        if let Err(e) = result {
            assert!(matches!(e, GridError::WriteConflict { version: 2, .. }), "got {e:?}");
        }
    }

    // Every slot holds exactly one version-2 write; readers see one of them.
    let read = grid.read_mutable(&cap).await.unwrap();
    assert!(read == b"writer a" || read == b"writer b");
    if a.is_ok() {
        assert_eq!(read, b"writer a");
    }
    if b.is_ok() {
        assert_eq!(read, b"writer b");
    }
}

#[tokio::test]
async fn read_cap_cannot_publish_or_delete() {
    let cluster = Cluster::new(4);
    let grid = cluster.grid(2, 4);
    let cap = grid.create_mutable(b"owned").await.unwrap();
    let read = cap.to_read_cap().unwrap();

    assert!(matches!(
        grid.publish(&read, b"forged", 2).await,
        Err(GridError::InvalidCapability(_))
    ));
    assert!(matches!(
        grid.delete_mutable(&read).await,
        Err(GridError::InvalidCapability(_))
    ));
    assert!(matches!(
        grid.read_mutable(&cap.to_verify_cap().unwrap()).await,
        Err(GridError::InvalidCapability(_))
    ));
}

#[tokio::test]
async fn mutable_read_survives_lost_peers() {
    let cluster = Cluster::new(10);
    let grid = cluster.grid(3, 10);
    let data = payload("mutable body", 150_000);
    let cap = grid.create_mutable(&data).await.unwrap();
    let si = cap.storage_index().unwrap();

    for node in cluster.holders(&si, ObjectKind::Mutable).iter().take(7) {
        node.set_down(true);
    }
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), data);
}

#[tokio::test]
async fn publish_without_quorum_is_insufficient_shares() {
    let cluster = Cluster::new(10);
    for node in &cluster.nodes[..5] {
        node.set_down(true);
    }
    let grid = cluster.grid(3, 10);
    // Five live peers take all ten shares, so quorum (6) is met.
    let cap = grid.create_mutable(b"five peers").await.unwrap();

    for node in &cluster.nodes {
        node.set_down(true);
    }
    let err = grid.update(&cap, b"nobody home").await.unwrap_err();
    assert!(
        matches!(err, GridError::InsufficientShares { have: 0, need: 6 }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn corrupt_slots_are_skipped() {
    let cluster = Cluster::new(6);
    let grid = cluster.grid(2, 6);
    let cap = grid.create_mutable(b"tamper-evident").await.unwrap();
    let si = cap.storage_index().unwrap();
    for node in cluster.holders(&si, ObjectKind::Mutable).iter().take(4) {
        node.set_corrupt(true);
    }
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), b"tamper-evident");

    for node in &cluster.nodes {
        node.set_corrupt(true);
    }
    assert!(matches!(
        grid.read_mutable(&cap).await,
        Err(GridError::InsufficientShares { have: 0, .. })
    ));
}

#[tokio::test]
async fn delete_removes_every_slot() {
    let cluster = Cluster::new(5);
    let grid = cluster.grid(2, 5);
    let cap = grid.create_mutable(b"short lived").await.unwrap();
    grid.update(&cap, b"still short lived").await.unwrap();

    let removed = grid.delete_mutable(&cap).await.unwrap();
    assert_eq!(removed, 5);
    assert!(matches!(
        grid.read_mutable(&cap).await,
        Err(GridError::InsufficientShares { have: 0, need: 2 })
    ));
    assert_eq!(grid.latest_version(&cap).await.unwrap(), 0);
}

#[tokio::test]
async fn write_cap_text_roundtrip_keeps_authority() {
    let cluster = Cluster::new(4);
    let grid = cluster.grid(2, 4);
    let cap = grid.create_mutable(b"one").await.unwrap();
    let parsed: Capability = cap.to_string().parse().unwrap();
    assert_eq!(grid.update(&parsed, b"two").await.unwrap(), 2);
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), b"two");
}

#[tokio::test]
async fn reported_versions_are_not_trusted() {
    let cluster = Cluster::new(6);
    let grid = cluster.grid(2, 6);
    let cap = grid.create_mutable(b"honest v1").await.unwrap();
    for node in &cluster.nodes[..2] {
        node.set_inflate_versions(true);
    }

    assert_eq!(grid.latest_version(&cap).await.unwrap(), 1);
    assert_eq!(grid.update(&cap, b"honest v2").await.unwrap(), 2);
    assert_eq!(grid.read_mutable(&cap).await.unwrap(), b"honest v2");
}

#[tokio::test]
async fn latest_version_needs_a_mutable_cap() {
    let cluster = Cluster::new(3);
    let grid = cluster.grid(2, 3);
    let immutable = grid.upload(b"not a slot").await.unwrap();
    assert!(matches!(
        grid.latest_version(&immutable).await,
        Err(GridError::InvalidCapability(_))
    ));
    assert!(matches!(
        grid.update(&immutable, b"nope").await,
        Err(GridError::InvalidCapability(_))
    ));
}
