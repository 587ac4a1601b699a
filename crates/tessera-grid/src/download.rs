//! Immutable retrieval
//!
//! Peers are asked in permutation order, at most `window` at a time. Each
//! peer lists what it holds for the storage index and we fetch only share
//! numbers we still lack. A share is accepted only once it verifies against
//! the capability's descriptor hash. As soon as `k` distinct shares are in
//! hand the outstanding queries are dropped.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tessera_codec::{decode, Hash, ObjectRef, Share};
use tessera_core::{GridError, GridResult, ShareId, ShareNum, StorageIndex};
use tessera_crypto::{ciphertext_len, decrypt_immutable, Capability};
use tessera_storage::StorageNode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::grid::Grid;
use crate::state::{OpKind, OpTracker, Phase};

/// Verified shares one peer gave us.
struct PeerAnswer {
    peer: usize,
    shares: Vec<Share>,
}

/// Ask one peer for every share of `storage_index` we don't yet have.
///
/// Unreachable peers, absent shares and shares that fail verification all
/// come back as an empty or shorter answer.
async fn query_peer(
    peer: usize,
    node: Arc<dyn StorageNode>,
    storage_index: StorageIndex,
    target: ObjectRef,
    have: HashSet<ShareNum>,
) -> PeerAnswer {
    let short = node.peer_id().short();
    let listed = match node.list_shares(storage_index).await {
        Ok(listed) => listed,
        Err(e) => {
            debug!(peer = %short, "list failed: {e}");
            return PeerAnswer { peer, shares: Vec::new() };
        }
    };

    let mut shares = Vec::new();
    for num in listed.into_iter().filter(|n| !have.contains(n)) {
        let id = ShareId::new(storage_index, num);
        let bytes = match node.get(id).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(share = %id, peer = %short, "listed share vanished");
                continue;
            }
            Err(e) => {
                debug!(share = %id, peer = %short, "fetch failed: {e}");
                continue;
            }
        };
        match Share::from_bytes(&bytes).and_then(|s| s.verify(&target).map(|()| s)) {
            Ok(share) if share.share_num == num => shares.push(share),
            Ok(share) => warn!(
                share = %id,
                peer = %short,
                claimed = share.share_num,
                "share served under the wrong number"
            ),
            Err(e) => warn!(share = %id, peer = %short, "rejecting share: {e}"),
        }
    }
    PeerAnswer { peer, shares }
}

/// What a retrieved share must match, from the fields of an immutable cap.
pub(crate) fn immutable_target(
    descriptor_hash: Hash,
    needed: u8,
    total: u8,
    size: u64,
) -> GridResult<ObjectRef> {
    if needed == 0 || needed > total {
        return Err(GridError::InvalidCapability(format!(
            "impossible encoding {needed}-of-{total}"
        )));
    }
    let size = ciphertext_len(size).ok_or_else(|| {
        GridError::InvalidCapability(format!("object size {size} is too large"))
    })?;
    Ok(ObjectRef {
        descriptor_hash,
        needed,
        total,
        size,
    })
}

impl Grid {
    /// Read the object a capability names.
    ///
    /// Immutable read caps are fetched, verified, decoded and decrypted.
    /// Mutable read and write caps read the latest version. Verify caps
    /// carry no key and are refused.
    pub async fn download(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> GridResult<Vec<u8>> {
        match cap {
            Capability::ImmutableRead {
                key,
                descriptor_hash,
                needed,
                total,
                size,
            } => {
                let storage_index = key.storage_index()?;
                let target = immutable_target(*descriptor_hash, *needed, *total, *size)?;
                let mut tracker = OpTracker::new(OpKind::Retrieve, storage_index);
                let shares = self
                    .collect_shares(&mut tracker, storage_index, target, cancel)
                    .await?;

                tracker.advance(Phase::Reconstructing)?;
                let ciphertext = tokio::task::spawn_blocking(move || decode(&shares, &target))
                    .await
                    .map_err(|e| GridError::Other(anyhow::anyhow!("decoder task failed: {e}")))?
                    .map_err(|e| tracker.fail(e))?;
                let plaintext = decrypt_immutable(key, &ciphertext).map_err(|e| tracker.fail(e))?;
                if plaintext.len() as u64 != *size {
                    return Err(tracker.fail(GridError::AuthenticationFailure(format!(
                        "decrypted {} bytes, capability says {size}",
                        plaintext.len()
                    ))));
                }
                tracker.advance(Phase::Done)?;
                Ok(plaintext)
            }
            Capability::MutableRead { .. } | Capability::MutableWrite { .. } => {
                self.read_mutable_cancellable(cap, cancel).await
            }
            Capability::ImmutableVerify { .. } | Capability::MutableVerify { .. } => Err(
                GridError::InvalidCapability("a verify cap cannot read contents".into()),
            ),
        }
    }

    /// Gather `target.needed` distinct verified shares.
    async fn collect_shares(
        &self,
        tracker: &mut OpTracker,
        storage_index: StorageIndex,
        target: ObjectRef,
        cancel: &CancellationToken,
    ) -> GridResult<Vec<Share>> {
        let need = target.needed as usize;
        let window = self.options().window.max(1);
        let peers = self.peers_for(&storage_index);
        tracker.advance(Phase::Querying)?;

        let mut have: BTreeMap<ShareNum, Share> = BTreeMap::new();
        let mut next_peer = 0;
        let mut in_flight = FuturesUnordered::new();

        while have.len() < need {
            while in_flight.len() < window && next_peer < peers.len() {
                let held: HashSet<ShareNum> = have.keys().copied().collect();
                in_flight.push(query_peer(
                    next_peer,
                    Arc::clone(&peers[next_peer]),
                    storage_index,
                    target,
                    held,
                ));
                next_peer += 1;
            }
            if in_flight.is_empty() {
                break;
            }

            let answer = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(tracker.fail(GridError::Cancelled));
                }
                answer = in_flight.next() => answer,
            };
            let Some(answer) = answer else { break };
            let got = answer.shares.len();
            for share in answer.shares {
                have.entry(share.share_num).or_insert(share);
            }
            debug!(
                peer = %peers[answer.peer].peer_id().short(),
                got,
                have = have.len(),
                need,
                "peer answered"
            );
        }
        drop(in_flight);

        if have.len() < need {
            return Err(tracker.fail(GridError::InsufficientShares {
                have: have.len(),
                need,
            }));
        }
        info!(storage_index = %storage_index, shares = have.len(), "enough shares verified");
        Ok(have.into_values().take(need).collect())
    }
}
