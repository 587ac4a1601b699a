//! The storage-node protocol as seen by a client
//!
//! Transport is someone else's problem: anything that can carry these calls
//! to a node (in-process, RPC, a test double) implements [`StorageNode`].
//! The trait is object safe so the coordinator can hold a heterogeneous
//! `Vec<Arc<dyn StorageNode>>`.

use bytes::Bytes;
use futures::future::BoxFuture;
use tessera_core::{GridResult, LeaseOwner, PeerId, ShareId, ShareNum, StorageIndex};
use tessera_crypto::{SignedDelete, SignedHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Bytes written and a fresh lease recorded
    Stored,
    /// The node already had this share; only the caller's lease was added
    AlreadyHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    StillLeased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutableOutcome {
    Accepted,
    /// The slot already holds `current` >= the offered version
    Stale { current: u64 },
}

/// One signed version of a mutable share, as stored in a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableSlot {
    pub header: SignedHeader,
    pub share: Bytes,
}

impl MutableSlot {
    /// `[signed header][share bytes]`
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(SignedHeader::ENCODED_LEN + self.share.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.share);
        Bytes::from(out)
    }

    pub fn from_bytes(mut data: Bytes) -> GridResult<Self> {
        if data.len() < SignedHeader::ENCODED_LEN {
            return Err(tessera_core::GridError::Codec(format!(
                "mutable slot is {} bytes, shorter than its header",
                data.len()
            )));
        }
        let share = data.split_off(SignedHeader::ENCODED_LEN);
        Ok(Self {
            header: SignedHeader::from_bytes(&data)?,
            share,
        })
    }
}

/// Counters a node reports about itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub shares: usize,
    pub slots: usize,
    pub bytes: u64,
    pub leases: usize,
}

/// Client-side view of one storage node.
///
/// Refusals (full, offline, share being reclaimed) come back as
/// `GridError::PeerUnavailable`; the coordinator moves to the next peer.
pub trait StorageNode: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Store an immutable share and record `owner`'s lease on it.
    fn put(&self, id: ShareId, share: Bytes, owner: LeaseOwner) -> BoxFuture<'_, GridResult<PutOutcome>>;

    /// Owned copy of a share's bytes; later deletion can't affect it.
    fn get(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<Bytes>>>;

    fn list_shares(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<ShareNum>>>;

    /// Returns the new expiry (unix seconds).
    fn renew_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<u64>>;

    fn cancel_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<()>>;

    fn delete_if_unleased(&self, id: ShareId) -> BoxFuture<'_, GridResult<DeleteOutcome>>;

    /// Store a signed version if it is strictly newer than the slot's.
    fn put_mutable(
        &self,
        id: ShareId,
        header: SignedHeader,
        share: Bytes,
        owner: LeaseOwner,
    ) -> BoxFuture<'_, GridResult<MutableOutcome>>;

    fn get_mutable(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<MutableSlot>>>;

    /// Slots held for a mutable object, with their versions.
    fn list_slots(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<(ShareNum, u64)>>>;

    /// Remove every slot of the object. Returns how many were removed.
    fn delete_mutable(
        &self,
        storage_index: StorageIndex,
        request: SignedDelete,
    ) -> BoxFuture<'_, GridResult<usize>>;
}
