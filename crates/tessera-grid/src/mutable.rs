//! Mutable objects: signed, versioned slots
//!
//! A publish encrypts under the object's read key with the version bound
//! into the AAD, encodes, signs a header over (storage index, version,
//! descriptor hash, size) and offers every share to its peer. Peers keep a
//! slot only if the signature checks out and the version is strictly newer
//! than what they hold. Readers take the highest version for which `k`
//! shares verify.

use bytes::Bytes;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tessera_codec::{decode, encode, ObjectRef, Share};
use tessera_core::{GridError, GridResult, ShareId, ShareNum, StorageIndex};
use tessera_crypto::{
    ciphertext_len, decrypt_mutable, encrypt_mutable, generate_signing_key, mutable_read_key,
    mutable_storage_index, Capability, ReadKey, SignedDelete, SignedHeader, SigningKey,
    VerifyingKey,
};
use tessera_storage::{MutableOutcome, StorageNode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::grid::Grid;
use crate::placement::{place_shares, PlaceResponse};
use crate::state::{OpKind, OpTracker, Phase};

/// Shares of one (version, descriptor) pair that verified.
#[derive(Debug)]
pub(crate) struct VersionGroup {
    pub header: SignedHeader,
    pub target: ObjectRef,
    pub shares: BTreeMap<ShareNum, Share>,
    pub holders: BTreeMap<ShareNum, Vec<usize>>,
}

impl VersionGroup {
    pub fn recoverable(&self) -> bool {
        self.shares.len() >= self.target.needed as usize
    }
}

/// Everything the peers returned for one mutable object.
#[derive(Debug, Default)]
pub(crate) struct SlotSurvey {
    /// Keyed by (version, descriptor hash)
    pub groups: BTreeMap<(u64, [u8; 32]), VersionGroup>,
    /// (peer index, share) pairs that failed verification
    pub corrupt: Vec<(usize, ShareNum)>,
    pub unreachable: Vec<usize>,
}

impl SlotSurvey {
    /// Newest version that can be reconstructed. Two writes racing at the
    /// same version are told apart by how many shares each holds.
    pub fn newest_recoverable(&self) -> Option<&VersionGroup> {
        self.groups
            .values()
            .filter(|g| g.recoverable())
            .max_by_key(|g| (g.header.version, g.shares.len()))
    }

    pub fn newest(&self) -> Option<&VersionGroup> {
        self.groups
            .values()
            .max_by_key(|g| (g.header.version, g.shares.len()))
    }
}

enum SlotAnswer {
    Unreachable,
    Slots(Vec<(ShareNum, Result<(SignedHeader, Share), GridError>)>),
}

/// Fetch and check every slot one peer holds for `storage_index`.
async fn query_slots(
    node: Arc<dyn StorageNode>,
    storage_index: StorageIndex,
    verifying_key: VerifyingKey,
) -> SlotAnswer {
    let listed = match node.list_slots(storage_index).await {
        Ok(listed) => listed,
        Err(e) => {
            debug!(peer = %node.peer_id().short(), "slot list failed: {e}");
            return SlotAnswer::Unreachable;
        }
    };
    let mut slots = Vec::with_capacity(listed.len());
    for (num, _version) in listed {
        let id = ShareId::new(storage_index, num);
        let checked = match node.get_mutable(id).await {
            Ok(Some(slot)) => check_slot(num, &storage_index, &verifying_key, slot.header, &slot.share),
            Ok(None) => continue,
            Err(e) => {
                debug!(share = %id, "slot fetch failed: {e}");
                continue;
            }
        };
        slots.push((num, checked));
    }
    SlotAnswer::Slots(slots)
}

fn check_slot(
    num: ShareNum,
    storage_index: &StorageIndex,
    verifying_key: &VerifyingKey,
    header: SignedHeader,
    payload: &[u8],
) -> GridResult<(SignedHeader, Share)> {
    if header.verifying_key != *verifying_key || header.storage_index != *storage_index {
        return Err(GridError::corrupt(num, "header signed by a different key"));
    }
    header
        .verify()
        .map_err(|e| GridError::corrupt(num, format!("bad header signature: {e}")))?;
    let share = Share::from_bytes(payload)?;
    if share.share_num != num {
        return Err(GridError::corrupt(num, "slot holds a different share number"));
    }
    let target = ObjectRef::from_descriptor(&share.descriptor);
    if target.descriptor_hash != header.descriptor_hash
        || Some(target.size) != ciphertext_len(header.size)
    {
        return Err(GridError::corrupt(num, "descriptor does not match signed header"));
    }
    share.verify(&target)?;
    Ok((header, share))
}

fn mutable_keys(cap: &Capability) -> GridResult<(ReadKey, VerifyingKey)> {
    match cap.to_read_cap()? {
        Capability::MutableRead {
            read_key,
            verifying_key,
        } => Ok((read_key, verifying_key)),
        _ => Err(GridError::InvalidCapability(
            "expected a mutable read or write cap".into(),
        )),
    }
}

fn signing_key(cap: &Capability) -> GridResult<&SigningKey> {
    match cap {
        Capability::MutableWrite { signing_key } => Ok(signing_key),
        _ => Err(GridError::InvalidCapability(
            "only a mutable write cap can publish or delete".into(),
        )),
    }
}

impl Grid {
    /// New mutable object holding `plaintext` as version 1.
    pub async fn create_mutable(&self, plaintext: &[u8]) -> GridResult<Capability> {
        let cap = Capability::MutableWrite {
            signing_key: generate_signing_key(),
        };
        self.publish(&cap, plaintext, 1).await?;
        Ok(cap)
    }

    /// Publish `plaintext` as `version`.
    ///
    /// Succeeds once `quorum` shares are accepted. Falls short with
    /// `WriteConflict` if any peer already had this or a newer version,
    /// otherwise with `InsufficientShares`.
    pub async fn publish(&self, cap: &Capability, plaintext: &[u8], version: u64) -> GridResult<()> {
        let signing_key = signing_key(cap)?;
        let read_key = mutable_read_key(signing_key)?;
        let storage_index = mutable_storage_index(&signing_key.verifying_key());
        let params = self.options().params;
        let mut tracker = OpTracker::new(OpKind::Place, storage_index);

        let ciphertext = encrypt_mutable(&read_key, &storage_index, version, plaintext)?;
        let encoded = tokio::task::spawn_blocking(move || encode(&ciphertext, &params))
            .await
            .map_err(|e| GridError::Other(anyhow::anyhow!("encoder task failed: {e}")))??;
        let header = SignedHeader::sign(
            signing_key,
            version,
            encoded.descriptor_hash(),
            plaintext.len() as u64,
        );

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
            let header = header.clone();
            let id = ShareId::new(storage_index, num);
            async move {
                match node.put_mutable(id, header, payload, owner).await {
                    Ok(MutableOutcome::Accepted) => PlaceResponse::Accepted,
                    Ok(MutableOutcome::Stale { current }) => PlaceResponse::Stale { current },
                    Err(e) => PlaceResponse::Refused(e),
                }
            }
            .boxed()
        })
        .await;

        let accepted = placement.distinct_shares();
        let quorum = self.options().quorum;
        if accepted < quorum {
            let err = if placement.stale.is_empty() {
                GridError::InsufficientShares {
                    have: accepted,
                    need: quorum,
                }
            } else {
                warn!(
                    storage_index = %storage_index,
                    version,
                    newest_seen = placement.stale.iter().max().copied().unwrap_or_default(),
                    "uncoordinated write detected"
                );
                GridError::WriteConflict {
                    version,
                    accepted,
                    needed: quorum,
                }
            };
            return Err(tracker.fail(err));
        }

        tracker.advance(Phase::Confirmed)?;
        info!(storage_index = %storage_index, version, shares = accepted, "version published");
        Ok(())
    }

    /// Publish `plaintext` as one past the highest version any peer holds.
    /// Returns the version written.
    pub async fn update(&self, cap: &Capability, plaintext: &[u8]) -> GridResult<u64> {
        signing_key(cap)?;
        let current = self.latest_version(cap).await?;
        let next = current.checked_add(1).ok_or(GridError::WriteConflict {
            version: current,
            accepted: 0,
            needed: self.options().quorum,
        })?;
        self.publish(cap, plaintext, next).await?;
        Ok(next)
    }

    /// Highest version whose signed header verifies on some reachable
    /// peer, 0 if none. Version numbers peers merely report are not trusted.
    pub async fn latest_version(&self, cap: &Capability) -> GridResult<u64> {
        let Capability::MutableVerify { verifying_key } = cap.to_verify_cap()? else {
            return Err(GridError::InvalidCapability(
                "expected a mutable cap".into(),
            ));
        };
        let storage_index = mutable_storage_index(&verifying_key);
        let survey = self.survey_slots(storage_index, verifying_key).await;
        Ok(survey.newest().map_or(0, |g| g.header.version))
    }

    /// Latest recoverable version of a mutable object.
    pub async fn read_mutable(&self, cap: &Capability) -> GridResult<Vec<u8>> {
        self.read_mutable_cancellable(cap, &CancellationToken::new()).await
    }

    pub(crate) async fn read_mutable_cancellable(
        &self,
        cap: &Capability,
        cancel: &CancellationToken,
    ) -> GridResult<Vec<u8>> {
        let (read_key, verifying_key) = mutable_keys(cap)?;
        let storage_index = mutable_storage_index(&verifying_key);
        let mut tracker = OpTracker::new(OpKind::Retrieve, storage_index);
        tracker.advance(Phase::Querying)?;

        let survey = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(tracker.fail(GridError::Cancelled)),
            survey = self.survey_slots(storage_index, verifying_key) => survey,
        };

        let Some(group) = survey.newest_recoverable() else {
            let (have, need) = survey
                .newest()
                .map(|g| (g.shares.len(), g.target.needed as usize))
                .unwrap_or((0, self.options().params.needed as usize));
            return Err(tracker.fail(GridError::InsufficientShares { have, need }));
        };
        if let Some(newest) = survey.newest() {
            if newest.header.version > group.header.version {
                warn!(
                    storage_index = %storage_index,
                    newest = newest.header.version,
                    reading = group.header.version,
                    "newest version is not recoverable; reading an older one"
                );
            }
        }

        tracker.advance(Phase::Reconstructing)?;
        let version = group.header.version;
        let size = group.header.size;
        let target = group.target;
        let shares: Vec<Share> = group
            .shares
            .values()
            .take(target.needed as usize)
            .cloned()
            .collect();
        let ciphertext = tokio::task::spawn_blocking(move || decode(&shares, &target))
            .await
            .map_err(|e| GridError::Other(anyhow::anyhow!("decoder task failed: {e}")))?
            .map_err(|e| tracker.fail(e))?;
        let plaintext = decrypt_mutable(&read_key, &storage_index, version, &ciphertext)
            .map_err(|e| tracker.fail(e))?;
        if plaintext.len() as u64 != size {
            return Err(tracker.fail(GridError::AuthenticationFailure(format!(
                "decrypted {} bytes, header says {size}",
                plaintext.len()
            ))));
        }
        tracker.advance(Phase::Done)?;
        debug!(storage_index = %storage_index, version, "mutable read");
        Ok(plaintext)
    }

    /// Ask every peer for its slots and sort the verified ones by version.
    pub(crate) async fn survey_slots(
        &self,
        storage_index: StorageIndex,
        verifying_key: VerifyingKey,
    ) -> SlotSurvey {
        let peers = self.peers_for(&storage_index);
        let mut queries: FuturesUnordered<_> = peers
            .iter()
            .enumerate()
            .map(|(i, node)| {
                query_slots(Arc::clone(node), storage_index, verifying_key).map(move |a| (i, a))
            })
            .collect();

        let mut survey = SlotSurvey::default();
        while let Some((peer, answer)) = queries.next().await {
            let slots = match answer {
                SlotAnswer::Unreachable => {
                    survey.unreachable.push(peer);
                    continue;
                }
                SlotAnswer::Slots(slots) => slots,
            };
            for (num, checked) in slots {
                match checked {
                    Ok((header, share)) => {
                        let key = (header.version, *header.descriptor_hash.as_bytes());
                        let group = survey.groups.entry(key).or_insert_with(|| VersionGroup {
                            target: ObjectRef::from_descriptor(&share.descriptor),
                            header,
                            shares: BTreeMap::new(),
                            holders: BTreeMap::new(),
                        });
                        group.holders.entry(num).or_default().push(peer);
                        group.shares.entry(num).or_insert(share);
                    }
                    Err(e) => {
                        warn!(peer = %peers[peer].peer_id().short(), share = num, "rejecting slot: {e}");
                        survey.corrupt.push((peer, num));
                    }
                }
            }
        }
        survey
    }

    /// Remove every slot of the object from every reachable peer.
    /// Returns the number of slots removed.
    pub async fn delete_mutable(&self, cap: &Capability) -> GridResult<usize> {
        let signing_key = signing_key(cap)?;
        let request = SignedDelete::sign(signing_key);
        let storage_index = request.storage_index;
        let results = join_all(self.peers_for(&storage_index).into_iter().map(|node| {
            let request = request.clone();
            async move {
                match node.delete_mutable(storage_index, request).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!(peer = %node.peer_id().short(), "delete failed: {e}");
                        0
                    }
                }
            }
        }))
        .await;
        let removed = results.into_iter().sum();
        info!(storage_index = %storage_index, removed, "mutable object deleted");
        Ok(removed)
    }
}

