//! Per-object peer ordering
//!
//! Every object gets its own ordering of the known peers, keyed by its
//! storage index. Uploaders and downloaders compute the same order from the
//! same inputs, so readers look first where writers put shares, and load
//! spreads evenly over the grid without any coordination.

use std::sync::Arc;
use tessera_core::{PeerId, StorageIndex};
use tessera_storage::StorageNode;

const PERMUTE_CONTEXT: &str = "tessera 2024 peer permutation";

/// Sort key of `peer` for objects stored under `storage_index`.
pub fn peer_rank(storage_index: &StorageIndex, peer: &PeerId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(PERMUTE_CONTEXT);
    hasher.update(storage_index.as_bytes());
    hasher.update(peer.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Peer ids in placement order for `storage_index`.
pub fn permute_ids(storage_index: &StorageIndex, peers: &[PeerId]) -> Vec<PeerId> {
    let mut ranked: Vec<([u8; 32], PeerId)> = peers
        .iter()
        .map(|p| (peer_rank(storage_index, p), *p))
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, p)| p).collect()
}

/// Nodes in placement order for `storage_index`.
pub fn permute_nodes(
    storage_index: &StorageIndex,
    nodes: &[Arc<dyn StorageNode>],
) -> Vec<Arc<dyn StorageNode>> {
    let mut ranked: Vec<([u8; 32], Arc<dyn StorageNode>)> = nodes
        .iter()
        .map(|n| (peer_rank(storage_index, &n.peer_id()), n.clone()))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked.into_iter().map(|(_, n)| n).collect()
}
