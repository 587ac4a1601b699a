//! Shared fixtures: an in-process grid of storage servers over OpenDAL's
//! memory backend, each wrapped in a node that can be taken down, made to
//! serve corrupted bytes, or made to hang.

#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use opendal::Operator;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{
    EncodingParams, GridError, GridResult, LeaseOwner, ObjectKind, PeerId, ShareId, ShareNum,
    StorageIndex,
};
use tessera_crypto::{LeaseSecret, SignedDelete, SignedHeader};
use tessera_grid::{Grid, GridOptions};
use tessera_storage::{
    Clock, Collector, DeleteOutcome, LeaseStore, ManualClock, MutableOutcome, MutableSlot, PutOutcome,
    ServerConfig, StorageNode, StorageServer,
};

pub const LEASE_SECS: u64 = 1_000;
pub const GRACE_SECS: u64 = 100;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

/// Deterministic pseudo-random payload.
pub fn payload(seed: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    blake3::Hasher::new()
        .update(seed.as_bytes())
        .finalize_xof()
        .fill(&mut out);
    out
}

pub struct FlakyNode {
    pub server: Arc<StorageServer>,
    down: AtomicBool,
    corrupt: AtomicBool,
    hang: AtomicBool,
    /// Report every listed slot at version u64::MAX
    inflate_versions: AtomicBool,
    /// Immutable puts accepted before refusing (usize::MAX = no limit)
    put_budget: AtomicUsize,
}

impl FlakyNode {
    fn new(server: Arc<StorageServer>) -> Self {
        Self {
            server,
            down: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            inflate_versions: AtomicBool::new(false),
            put_budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_inflate_versions(&self, inflate: bool) {
        self.inflate_versions.store(inflate, Ordering::SeqCst);
    }

    pub fn limit_puts(&self, n: usize) {
        self.put_budget.store(n, Ordering::SeqCst);
    }

    fn gate(&self) -> GridResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GridError::peer_unavailable(self.server.peer_id().short(), "offline"));
        }
        Ok(())
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
    }

    /// Flip one byte near the end, inside the last block.
    fn mangle(&self, bytes: Bytes) -> Bytes {
        if !self.corrupt.load(Ordering::SeqCst) || bytes.is_empty() {
            return bytes;
        }
        let mut v = bytes.to_vec();
        let i = v.len() - 1;
        v[i] ^= 0x5A;
        Bytes::from(v)
    }
}

impl StorageNode for FlakyNode {
    fn peer_id(&self) -> PeerId {
        self.server.peer_id()
    }

    fn put(&self, id: ShareId, share: Bytes, owner: LeaseOwner) -> BoxFuture<'_, GridResult<PutOutcome>> {
        async move {
            self.gate()?;
            let budget = self.put_budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(GridError::peer_unavailable(self.peer_id().short(), "full"));
            }
            if budget != usize::MAX {
                self.put_budget.store(budget - 1, Ordering::SeqCst);
            }
            self.server.put(id, share, owner).await
        }
        .boxed()
    }

    fn get(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<Bytes>>> {
        async move {
            self.gate()?;
            Ok(self.server.get(id).await?.map(|b| self.mangle(b)))
        }
        .boxed()
    }

    fn list_shares(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<ShareNum>>> {
        async move {
            self.gate()?;
            self.maybe_hang().await;
            self.server.list_shares(storage_index).await
        }
        .boxed()
    }

    fn renew_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<u64>> {
        async move {
            self.gate()?;
            self.server.renew_lease(id, owner).await
        }
        .boxed()
    }

    fn cancel_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<()>> {
        async move {
            self.gate()?;
            self.server.cancel_lease(id, owner).await
        }
        .boxed()
    }

    fn delete_if_unleased(&self, id: ShareId) -> BoxFuture<'_, GridResult<DeleteOutcome>> {
        async move {
            self.gate()?;
            self.server.delete_if_unleased(id).await
        }
        .boxed()
    }

    fn put_mutable(
        &self,
        id: ShareId,
        header: SignedHeader,
        share: Bytes,
        owner: LeaseOwner,
    ) -> BoxFuture<'_, GridResult<MutableOutcome>> {
        async move {
            self.gate()?;
            self.server.put_mutable(id, header, share, owner).await
        }
        .boxed()
    }

    fn get_mutable(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<MutableSlot>>> {
        async move {
            self.gate()?;
            let Some(slot) = self.server.get_mutable(id).await? else {
                return Ok(None);
            };
            Ok(Some(MutableSlot {
                header: slot.header,
                share: self.mangle(slot.share),
            }))
        }
        .boxed()
    }

    fn list_slots(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<(ShareNum, u64)>>> {
        async move {
            self.gate()?;
            self.maybe_hang().await;
            let slots = self.server.list_slots(storage_index).await?;
            if self.inflate_versions.load(Ordering::SeqCst) {
                return Ok(slots.into_iter().map(|(num, _)| (num, u64::MAX)).collect());
            }
            Ok(slots)
        }
        .boxed()
    }

    fn delete_mutable(
        &self,
        storage_index: StorageIndex,
        request: SignedDelete,
    ) -> BoxFuture<'_, GridResult<usize>> {
        async move {
            self.gate()?;
            self.server.delete_mutable(storage_index, request).await
        }
        .boxed()
    }
}

pub struct Cluster {
    pub nodes: Vec<Arc<FlakyNode>>,
    pub clock: Arc<ManualClock>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let nodes = (0..size)
            .map(|i| {
                let server = StorageServer::with_clock(
                    PeerId::from_name(&format!("storage-{i}")),
                    memory_operator(),
                    Arc::new(LeaseStore::in_memory()),
                    ServerConfig {
                        lease_duration_secs: LEASE_SECS,
                        capacity_bytes: 0,
                    },
                    clock.clone(),
                );
                Arc::new(FlakyNode::new(Arc::new(server)))
            })
            .collect();
        Self { nodes, clock }
    }

    pub fn peers(&self) -> Vec<Arc<dyn StorageNode>> {
        self.nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn StorageNode>)
            .collect()
    }

    pub fn options(&self, k: u8, n: u8) -> GridOptions {
        let params = EncodingParams::new(k, n)
            .and_then(|p| p.with_segment_size(64 * 1024))
            .expect("valid params");
        GridOptions::new(params).with_lease_secret(LeaseSecret::from_bytes([7; 32]))
    }

    pub fn grid(&self, k: u8, n: u8) -> Grid {
        Grid::new(self.peers(), self.options(k, n))
    }

    /// Nodes holding at least one share or slot of `storage_index`.
    pub fn holders(&self, storage_index: &StorageIndex, kind: ObjectKind) -> Vec<Arc<FlakyNode>> {
        self.nodes
            .iter()
            .filter(|n| !n.server.leases().shares_for(storage_index, kind).is_empty())
            .cloned()
            .collect()
    }

    pub fn total_leases(&self) -> usize {
        self.nodes.iter().map(|n| n.server.stats().leases).sum()
    }

    pub fn total_shares(&self) -> usize {
        self.nodes.iter().map(|n| n.server.stats().shares).sum()
    }

    /// Run one expiry sweep on every node at the cluster clock.
    pub async fn sweep(&self) -> usize {
        let mut reclaimed = 0;
        for node in &self.nodes {
            let collector = Collector::for_server(&node.server, GRACE_SECS);
            reclaimed += collector.expire_sweep(self.clock.now()).await.reclaimed;
        }
        reclaimed
    }
}
