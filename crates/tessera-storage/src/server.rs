//! In-process storage node: share bytes in an OpenDAL operator, leases in a
//! [`LeaseStore`]
//!
//! Layout inside the operator:
//! ```text
//! shares/{storage_index_hex}/{share_num}   immutable share bytes
//! slots/{storage_index_hex}/{share_num}    [signed header][share bytes]
//! ```

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use opendal::Operator;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{
    GridError, GridResult, LeaseOwner, ObjectKind, PeerId, ShareId, ShareNum, StorageIndex,
};
use tessera_crypto::{SignedDelete, SignedHeader};
use tracing::{debug, info, warn};

use crate::lease::{AddLease, Clock, LeaseStore, ReclaimMark, SystemClock, VersionCheck};
use crate::protocol::{
    DeleteOutcome, MutableOutcome, MutableSlot, NodeStats, PutOutcome, StorageNode,
};

/// Operator path of a share or slot
pub fn share_path(id: &ShareId, kind: ObjectKind) -> String {
    let dir = match kind {
        ObjectKind::Immutable => "shares",
        ObjectKind::Mutable => "slots",
    };
    format!("{dir}/{}/{}", id.storage_index.to_hex(), id.share_num)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub lease_duration_secs: u64,
    /// 0 = unlimited
    pub capacity_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: 31 * 24 * 3600,
            capacity_bytes: 0,
        }
    }
}

impl From<&tessera_core::config::TesseraConfig> for ServerConfig {
    fn from(cfg: &tessera_core::config::TesseraConfig) -> Self {
        Self {
            lease_duration_secs: cfg.lease.duration_secs,
            capacity_bytes: cfg.node.capacity_bytes,
        }
    }
}

pub struct StorageServer {
    peer_id: PeerId,
    op: Operator,
    leases: Arc<LeaseStore>,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
    /// Serializes mutable writes per slot
    slot_locks: std::sync::Mutex<HashMap<ShareId, Arc<tokio::sync::Mutex<()>>>>,
}

impl StorageServer {
    pub fn new(peer_id: PeerId, op: Operator, leases: Arc<LeaseStore>, config: ServerConfig) -> Self {
        Self::with_clock(peer_id, op, leases, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        peer_id: PeerId,
        op: Operator,
        leases: Arc<LeaseStore>,
        config: ServerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            peer_id,
            op,
            leases,
            clock,
            config,
            slot_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn leases(&self) -> &Arc<LeaseStore> {
        &self.leases
    }

    pub fn stats(&self) -> NodeStats {
        let s = self.leases.stats();
        NodeStats {
            shares: s.shares,
            slots: s.slots,
            bytes: s.bytes,
            leases: s.leases,
        }
    }

    fn expiry(&self) -> u64 {
        self.clock.now().saturating_add(self.config.lease_duration_secs)
    }

    fn refuse(&self, reason: impl ToString) -> GridError {
        GridError::peer_unavailable(self.peer_id.short(), reason)
    }

    fn check_capacity(&self, incoming: u64, replacing: u64) -> GridResult<()> {
        if self.config.capacity_bytes == 0 {
            return Ok(());
        }
        let held = self.leases.stats().bytes.saturating_sub(replacing);
        if held.saturating_add(incoming) > self.config.capacity_bytes {
            return Err(self.refuse(format!(
                "full: {held} of {} bytes held, {incoming} offered",
                self.config.capacity_bytes
            )));
        }
        Ok(())
    }

    fn slot_lock(&self, id: ShareId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.slot_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id).or_default().clone()
    }

    async fn read(&self, path: &str) -> GridResult<Option<Bytes>> {
        match self.op.read(path).await {
            Ok(buf) => Ok(Some(buf.to_bytes())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GridError::Storage(format!("read {path}: {e}"))),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> GridResult<()> {
        self.op
            .write(path, data)
            .await
            .map(|_| ())
            .map_err(|e| GridError::Storage(format!("write {path}: {e}")))
    }

    pub(crate) async fn delete_bytes(op: &Operator, path: &str) -> GridResult<()> {
        op.delete(path)
            .await
            .map_err(|e| GridError::Storage(format!("delete {path}: {e}")))
    }

    async fn do_put(&self, id: ShareId, share: Bytes, owner: LeaseOwner) -> GridResult<PutOutcome> {
        let size = share.len() as u64;
        let expires_at = self.expiry();

        match self.leases.record(id).map(|r| r.state) {
            Some(crate::lease::ShareState::Reclaiming) => {
                return Err(self.refuse(format!("share {id} is being reclaimed")));
            }
            Some(crate::lease::ShareState::Live) => {
                return match self.leases.add_lease(id, ObjectKind::Immutable, size, owner, expires_at) {
                    AddLease::Reclaiming => Err(self.refuse(format!("share {id} is being reclaimed"))),
                    _ => {
                        debug!(share = %id, "share already held, lease added");
                        Ok(PutOutcome::AlreadyHeld)
                    }
                };
            }
            None => {}
        }

        self.check_capacity(size, 0)?;
        self.write(&share_path(&id, ObjectKind::Immutable), share).await?;

        match self.leases.add_lease(id, ObjectKind::Immutable, size, owner, expires_at) {
            AddLease::Created => {
                debug!(share = %id, bytes = size, "share stored");
                Ok(PutOutcome::Stored)
            }
            AddLease::Added => Ok(PutOutcome::AlreadyHeld),
            AddLease::Reclaiming => Err(self.refuse(format!("share {id} is being reclaimed"))),
        }
    }

    async fn do_delete_if_unleased(&self, id: ShareId) -> GridResult<DeleteOutcome> {
        match self.leases.mark_unleased_for_reclaim(id, self.clock.now()) {
            ReclaimMark::StillLeased => Ok(DeleteOutcome::StillLeased),
            ReclaimMark::Missing => Err(GridError::ShareNotFound(id.to_string())),
            ReclaimMark::Marked { kind, .. } => {
                if let Err(e) = Self::delete_bytes(&self.op, &share_path(&id, kind)).await {
                    self.leases.abort_reclaim(id);
                    return Err(e);
                }
                self.leases.finish_reclaim(id);
                info!(share = %id, "unleased share deleted");
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn do_put_mutable(
        &self,
        id: ShareId,
        header: SignedHeader,
        share: Bytes,
        owner: LeaseOwner,
    ) -> GridResult<MutableOutcome> {
        if header.storage_index != id.storage_index {
            return Err(GridError::AuthenticationFailure(format!(
                "header signed for {}, offered for {}",
                header.storage_index, id.storage_index
            )));
        }
        header.verify()?;

        let lock = self.slot_lock(id);
        let _guard = lock.lock().await;

        match self.leases.check_version(id, header.version) {
            VersionCheck::Reclaiming => {
                return Err(self.refuse(format!("slot {id} is being reclaimed")));
            }
            VersionCheck::Stale { current } => {
                debug!(slot = %id, offered = header.version, current, "stale mutable write");
                return Ok(MutableOutcome::Stale { current });
            }
            VersionCheck::Newer => {}
        }

        let slot = MutableSlot { header, share };
        let data = slot.to_bytes();
        let size = data.len() as u64;
        let replacing = self.leases.record(id).map(|r| r.size).unwrap_or(0);
        self.check_capacity(size, replacing)?;

        let path = share_path(&id, ObjectKind::Mutable);
        self.write(&path, data).await?;
        let recorded = self
            .leases
            .record_version(id, slot.header.version, size, owner, self.expiry());
        if recorded == AddLease::Reclaiming {
            // The collector took the slot while we were writing. We hold the
            // slot lock, so these bytes are ours alone.
            if let Err(e) = Self::delete_bytes(&self.op, &path).await {
                warn!(slot = %id, "failed to drop bytes of a refused write: {e}");
            }
            return Err(self.refuse(format!("slot {id} is being reclaimed")));
        }
        debug!(slot = %id, version = slot.header.version, "mutable version accepted");
        Ok(MutableOutcome::Accepted)
    }

    async fn do_get_mutable(&self, id: ShareId) -> GridResult<Option<MutableSlot>> {
        match self.read(&share_path(&id, ObjectKind::Mutable)).await? {
            Some(data) => Ok(Some(MutableSlot::from_bytes(data)?)),
            None => Ok(None),
        }
    }

    async fn do_delete_mutable(
        &self,
        storage_index: StorageIndex,
        request: SignedDelete,
    ) -> GridResult<usize> {
        if request.storage_index != storage_index {
            return Err(GridError::AuthenticationFailure(
                "delete request signed for another object".into(),
            ));
        }
        request.verify()?;

        let mut removed = 0;
        for (num, _) in self.leases.shares_for(&storage_index, ObjectKind::Mutable) {
            let id = ShareId::new(storage_index, num);
            let lock = self.slot_lock(id);
            let _guard = lock.lock().await;
            Self::delete_bytes(&self.op, &share_path(&id, ObjectKind::Mutable)).await?;
            if self.leases.remove(id).is_some() {
                removed += 1;
            }
        }
        info!(storage_index = %storage_index, slots = removed, "mutable object deleted");
        Ok(removed)
    }
}

impl StorageNode for StorageServer {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn put(&self, id: ShareId, share: Bytes, owner: LeaseOwner) -> BoxFuture<'_, GridResult<PutOutcome>> {
        self.do_put(id, share, owner).boxed()
    }

    fn get(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<Bytes>>> {
        async move { self.read(&share_path(&id, ObjectKind::Immutable)).await }.boxed()
    }

    fn list_shares(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<ShareNum>>> {
        async move {
            Ok(self
                .leases
                .shares_for(&storage_index, ObjectKind::Immutable)
                .into_iter()
                .map(|(num, _)| num)
                .collect())
        }
        .boxed()
    }

    fn renew_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<u64>> {
        async move { self.leases.renew(id, &owner, self.expiry()) }.boxed()
    }

    fn cancel_lease(&self, id: ShareId, owner: LeaseOwner) -> BoxFuture<'_, GridResult<()>> {
        async move {
            if !self.leases.cancel(id, &owner)? {
                warn!(share = %id, "cancel for a lease this owner does not hold");
            }
            Ok(())
        }
        .boxed()
    }

    fn delete_if_unleased(&self, id: ShareId) -> BoxFuture<'_, GridResult<DeleteOutcome>> {
        self.do_delete_if_unleased(id).boxed()
    }

    fn put_mutable(
        &self,
        id: ShareId,
        header: SignedHeader,
        share: Bytes,
        owner: LeaseOwner,
    ) -> BoxFuture<'_, GridResult<MutableOutcome>> {
        self.do_put_mutable(id, header, share, owner).boxed()
    }

    fn get_mutable(&self, id: ShareId) -> BoxFuture<'_, GridResult<Option<MutableSlot>>> {
        self.do_get_mutable(id).boxed()
    }

    fn list_slots(&self, storage_index: StorageIndex) -> BoxFuture<'_, GridResult<Vec<(ShareNum, u64)>>> {
        async move {
            Ok(self
                .leases
                .shares_for(&storage_index, ObjectKind::Mutable)
                .into_iter()
                .filter_map(|(num, version)| version.map(|v| (num, v)))
                .collect())
        }
        .boxed()
    }

    fn delete_mutable(
        &self,
        storage_index: StorageIndex,
        request: SignedDelete,
    ) -> BoxFuture<'_, GridResult<usize>> {
        self.do_delete_mutable(storage_index, request).boxed()
    }
}
