//! Immutable upload: encrypt, encode, place

use bytes::Bytes;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_codec::encode;
use tessera_core::{GridError, GridResult, ShareId, ShareNum};
use tessera_crypto::{derive_convergent_key, encrypt_immutable, Capability};
use tracing::{debug, info, warn};

use crate::grid::Grid;
use crate::placement::{place_shares, PlaceResponse};
use crate::state::{OpKind, OpTracker, Phase};

impl Grid {
    /// Store `plaintext` as an immutable object and return its read cap.
    ///
    /// The same plaintext under the same parameters and convergence secret
    /// always yields the same capability; re-uploading only adds leases.
    pub async fn upload(&self, plaintext: &[u8]) -> GridResult<Capability> {
        let params = self.options().params;
        let key = derive_convergent_key(plaintext, &params, self.options().convergence.as_ref());
        let storage_index = key.storage_index()?;
        let mut tracker = OpTracker::new(OpKind::Place, storage_index);

        let ciphertext = encrypt_immutable(&key, plaintext)?;
        let encoded = tokio::task::spawn_blocking(move || encode(&ciphertext, &params))
            .await
            .map_err(|e| GridError::Other(anyhow::anyhow!("encoder task failed: {e}")))??;
        let descriptor_hash = encoded.descriptor_hash();

        let owner = self.options().lease_secret.lease_owner(&storage_index);
        let payloads: HashMap<ShareNum, Bytes> = encoded
            .shares
            .iter()
            .map(|s| (s.share_num, s.to_bytes()))
            .collect();
        let nums: Vec<ShareNum> = encoded.shares.iter().map(|s| s.share_num).collect();

        tracker.advance(Phase::Uploading)?;
        let peers = self.peers_for(&storage_index);
        let placement = place_shares(&peers, &nums, |node, num| {
            let payload = payloads.get(&num).cloned().unwrap_or_default();
            let id = ShareId::new(storage_index, num);
            async move {
                match node.put(id, payload, owner).await {
                    Ok(outcome) => {
                        debug!(share = num, ?outcome, "put");
                        PlaceResponse::Accepted
                    }
                    Err(e) => PlaceResponse::Refused(e),
                }
            }
            .boxed()
        })
        .await;

        let placed = placement.distinct_shares();
        let happy = self.options().happy;
        if placed < happy {
            // Release what we did place so the collector can take it back.
            let cancels = placement.holders.iter().map(|(num, peer)| {
                let node = Arc::clone(&peers[*peer]);
                let id = ShareId::new(storage_index, *num);
                async move {
                    if let Err(e) = node.cancel_lease(id, owner).await {
                        warn!(share = %id, peer = %node.peer_id().short(), "lease cancel failed: {e}");
                    }
                }
            });
            join_all(cancels).await;
            return Err(tracker.fail(GridError::InsufficientShares {
                have: placed,
                need: happy,
            }));
        }

        tracker.advance(Phase::Confirmed)?;
        info!(
            storage_index = %storage_index,
            shares = placed,
            refusals = placement.refusals,
            bytes = plaintext.len(),
            "upload confirmed"
        );
        Ok(Capability::ImmutableRead {
            key,
            descriptor_hash,
            needed: params.needed,
            total: params.total,
            size: plaintext.len() as u64,
        })
    }
}
