//! Lease table for a storage node
//!
//! Every share a node holds has a record listing the leases clients took on
//! it. A share stays while at least one lease is inside its expiry plus the
//! grace period; the collector reclaims it after that.
//!
//! All mutations go through one `Mutex`, so "check then mark" is atomic per
//! share: a renewal either lands before the sweep marks the share (and keeps
//! it) or after (and gets `ShareNotFound`). Records being reclaimed stay in
//! the table in the `Reclaiming` state until their bytes are gone, which
//! makes each share reclaimable exactly once.
//!
//! The table can be persisted to a JSON file; [`LeaseStore::flush`] writes
//! it atomically (temp file, then rename).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_core::{GridError, GridResult, LeaseOwner, ObjectKind, ShareId, ShareNum, StorageIndex};

/// Source of "now" in unix seconds. Injected so tests can move time.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: LeaseOwner,
    /// Unix seconds
    pub expires_at: u64,
    pub renewals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareState {
    Live,
    Reclaiming,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: ShareId,
    pub kind: ObjectKind,
    /// Stored bytes
    pub size: u64,
    /// Highest accepted version (mutable slots only)
    #[serde(default)]
    pub version: Option<u64>,
    pub state: ShareState,
    pub leases: Vec<Lease>,
}

impl ShareRecord {
    /// True once no lease is inside its expiry plus `grace` at `now`.
    pub fn is_expired(&self, now: u64, grace: u64) -> bool {
        self.leases
            .iter()
            .all(|l| l.expires_at.saturating_add(grace) <= now)
    }

    fn has_active_lease(&self, now: u64) -> bool {
        self.leases.iter().any(|l| l.expires_at > now)
    }
}

/// Result of [`LeaseStore::add_lease`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddLease {
    /// No record existed; the caller has just stored the bytes
    Created,
    /// The share was already held; a lease was added or extended
    Added,
    /// The share is being reclaimed; the put must be refused
    Reclaiming,
}

/// Result of a strict version check on a mutable slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Newer,
    Stale { current: u64 },
    Reclaiming,
}

/// Result of [`LeaseStore::mark_unleased_for_reclaim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMark {
    Marked { kind: ObjectKind, size: u64 },
    StillLeased,
    Missing,
}

/// Share picked by a sweep, already marked `Reclaiming`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimCandidate {
    pub share_id: ShareId,
    pub kind: ObjectKind,
    pub size: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseStats {
    pub shares: usize,
    pub slots: usize,
    pub bytes: u64,
    pub leases: usize,
}

struct Inner {
    records: BTreeMap<ShareId, ShareRecord>,
    dirty: bool,
}

/// The node's lease table. Cheap to share behind an `Arc`.
pub struct LeaseStore {
    inner: Mutex<Inner>,
    /// JSON file the table is flushed to, if persistent
    path: Option<PathBuf>,
}

impl LeaseStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                dirty: false,
            }),
            path: None,
        }
    }

    /// Load or create a persistent lease table at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let records: Vec<ShareRecord> = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading lease table: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing lease table: {}", path.display()))?
        } else {
            Vec::new()
        };

        let records = records
            .into_iter()
            .map(|mut r| {
                // A crash mid-sweep leaves records marked; the next sweep retries them.
                r.state = ShareState::Live;
                (r.share_id, r)
            })
            .collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                records,
                dirty: false,
            }),
            path: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add (or extend) `owner`'s lease on a share, creating the record if absent.
    pub fn add_lease(
        &self,
        share_id: ShareId,
        kind: ObjectKind,
        size: u64,
        owner: LeaseOwner,
        expires_at: u64,
    ) -> AddLease {
        let mut inner = self.lock();
        let outcome = match inner.records.get_mut(&share_id) {
            Some(record) if record.state == ShareState::Reclaiming => return AddLease::Reclaiming,
            Some(record) => {
                upsert_lease(record, owner, expires_at);
                AddLease::Added
            }
            None => {
                inner.records.insert(
                    share_id,
                    ShareRecord {
                        share_id,
                        kind,
                        size,
                        version: None,
                        state: ShareState::Live,
                        leases: vec![Lease {
                            owner,
                            expires_at,
                            renewals: 0,
                        }],
                    },
                );
                AddLease::Created
            }
        };
        inner.dirty = true;
        outcome
    }

    /// Extend `owner`'s lease. Unknown or reclaiming shares, and shares the
    /// owner holds no lease on, are `ShareNotFound`.
    pub fn renew(&self, share_id: ShareId, owner: &LeaseOwner, expires_at: u64) -> GridResult<u64> {
        let mut inner = self.lock();
        let record = match inner.records.get_mut(&share_id) {
            Some(r) if r.state == ShareState::Live => r,
            _ => return Err(GridError::ShareNotFound(share_id.to_string())),
        };
        let lease = record
            .leases
            .iter_mut()
            .find(|l| &l.owner == owner)
            .ok_or_else(|| GridError::ShareNotFound(format!("{share_id}: no lease for this owner")))?;
        lease.expires_at = lease.expires_at.max(expires_at);
        lease.renewals = lease.renewals.saturating_add(1);
        let new_expiry = lease.expires_at;
        inner.dirty = true;
        Ok(new_expiry)
    }

    /// Drop `owner`'s lease. Returns true if one was removed.
    pub fn cancel(&self, share_id: ShareId, owner: &LeaseOwner) -> GridResult<bool> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(&share_id)
            .ok_or_else(|| GridError::ShareNotFound(share_id.to_string()))?;
        let before = record.leases.len();
        record.leases.retain(|l| &l.owner != owner);
        let removed = record.leases.len() != before;
        if removed {
            inner.dirty = true;
        }
        Ok(removed)
    }

    /// Mark a share for reclamation if no lease is active at `now`.
    pub fn mark_unleased_for_reclaim(&self, share_id: ShareId, now: u64) -> ReclaimMark {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(&share_id) else {
            return ReclaimMark::Missing;
        };
        if record.state == ShareState::Reclaiming {
            return ReclaimMark::Missing;
        }
        if record.has_active_lease(now) {
            return ReclaimMark::StillLeased;
        }
        record.state = ShareState::Reclaiming;
        let mark = ReclaimMark::Marked {
            kind: record.kind,
            size: record.size,
        };
        inner.dirty = true;
        mark
    }

    /// Mark every live share whose leases all expired at least `grace`
    /// seconds before `now`, and return them.
    pub fn begin_sweep(&self, now: u64, grace: u64) -> Vec<ReclaimCandidate> {
        let mut inner = self.lock();
        let mut picked = Vec::new();
        for record in inner.records.values_mut() {
            if record.state == ShareState::Live && record.is_expired(now, grace) {
                record.state = ShareState::Reclaiming;
                picked.push(ReclaimCandidate {
                    share_id: record.share_id,
                    kind: record.kind,
                    size: record.size,
                });
            }
        }
        if !picked.is_empty() {
            inner.dirty = true;
        }
        picked
    }

    /// Bytes are gone; drop the record.
    pub fn finish_reclaim(&self, share_id: ShareId) {
        let mut inner = self.lock();
        if inner.records.remove(&share_id).is_some() {
            inner.dirty = true;
        }
    }

    /// Deleting the bytes failed; put the share back in service.
    pub fn abort_reclaim(&self, share_id: ShareId) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(&share_id) {
            record.state = ShareState::Live;
        }
    }

    /// Strict version check for a mutable slot.
    pub fn check_version(&self, share_id: ShareId, version: u64) -> VersionCheck {
        let inner = self.lock();
        match inner.records.get(&share_id) {
            Some(r) if r.state == ShareState::Reclaiming => VersionCheck::Reclaiming,
            Some(r) => match r.version {
                Some(current) if current >= version => VersionCheck::Stale { current },
                _ => VersionCheck::Newer,
            },
            None => VersionCheck::Newer,
        }
    }

    /// Record an accepted mutable version and the writer's lease.
    ///
    /// A slot the collector marked after the version check stays marked and
    /// untouched: the writer gets `Reclaiming` and must drop its bytes.
    pub fn record_version(
        &self,
        share_id: ShareId,
        version: u64,
        size: u64,
        owner: LeaseOwner,
        expires_at: u64,
    ) -> AddLease {
        let mut inner = self.lock();
        let outcome = match inner.records.get_mut(&share_id) {
            Some(record) if record.state == ShareState::Reclaiming => return AddLease::Reclaiming,
            Some(record) => {
                record.version = Some(version);
                record.size = size;
                upsert_lease(record, owner, expires_at);
                AddLease::Added
            }
            None => {
                let mut record = ShareRecord {
                    share_id,
                    kind: ObjectKind::Mutable,
                    size,
                    version: Some(version),
                    state: ShareState::Live,
                    leases: Vec::new(),
                };
                upsert_lease(&mut record, owner, expires_at);
                inner.records.insert(share_id, record);
                AddLease::Created
            }
        };
        inner.dirty = true;
        outcome
    }

    /// Remove a record outright (signed mutable delete).
    pub fn remove(&self, share_id: ShareId) -> Option<ShareRecord> {
        let mut inner = self.lock();
        let removed = inner.records.remove(&share_id);
        if removed.is_some() {
            inner.dirty = true;
        }
        removed
    }

    pub fn record(&self, share_id: ShareId) -> Option<ShareRecord> {
        self.lock().records.get(&share_id).cloned()
    }

    /// Live shares of one object, with their versions (mutable slots).
    pub fn shares_for(&self, storage_index: &StorageIndex, kind: ObjectKind) -> Vec<(ShareNum, Option<u64>)> {
        let inner = self.lock();
        let range = ShareId::new(*storage_index, 0)..=ShareId::new(*storage_index, ShareNum::MAX);
        inner
            .records
            .range(range)
            .filter(|(_, r)| r.kind == kind && r.state == ShareState::Live)
            .map(|(id, r)| (id.share_num, r.version))
            .collect()
    }

    pub fn stats(&self) -> LeaseStats {
        let inner = self.lock();
        let mut stats = LeaseStats::default();
        for r in inner.records.values() {
            match r.kind {
                ObjectKind::Immutable => stats.shares += 1,
                ObjectKind::Mutable => stats.slots += 1,
            }
            stats.bytes += r.size;
            stats.leases += r.leases.len();
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    /// Flush dirty changes to disk using an atomic write (write then rename).
    /// A no-op for in-memory tables.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lease dir: {}", parent.display()))?;
        }

        let records: Vec<&ShareRecord> = inner.records.values().collect();
        let json = serde_json::to_string_pretty(&records).context("serializing lease table")?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing lease table temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming lease table: {}", path.display()))?;

        inner.dirty = false;
        Ok(())
    }
}

impl Drop for LeaseStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("failed to flush lease table on drop: {e}");
        }
    }
}

fn upsert_lease(record: &mut ShareRecord, owner: LeaseOwner, expires_at: u64) {
    match record.leases.iter_mut().find(|l| l.owner == owner) {
        Some(lease) => {
            lease.expires_at = lease.expires_at.max(expires_at);
            lease.renewals = lease.renewals.saturating_add(1);
        }
        None => record.leases.push(Lease {
            owner,
            expires_at,
            renewals: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(si: u8, num: ShareNum) -> ShareId {
        ShareId::new(StorageIndex([si; 32]), num)
    }

    fn owner(b: u8) -> LeaseOwner {
        LeaseOwner([b; 32])
    }

    const GRACE: u64 = 100;

    #[test]
    fn test_add_lease_dedups_share() {
        let store = LeaseStore::in_memory();
        assert_eq!(
            store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(1), 1000),
            AddLease::Created
        );
        assert_eq!(
            store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(2), 2000),
            AddLease::Added
        );
        // same owner again extends rather than duplicating
        assert_eq!(
            store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(2), 3000),
            AddLease::Added
        );
        let record = store.record(id(1, 0)).unwrap();
        assert_eq!(record.leases.len(), 2);
        assert_eq!(record.leases[1].expires_at, 3000);
        assert_eq!(store.stats().bytes, 10, "bytes counted once per share");
    }

    #[test]
    fn test_active_lease_never_swept() {
        let store = LeaseStore::in_memory();
        store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(1), 1000);
        store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(2), 5000);

        // first lease long expired, second still inside expiry + grace
        assert!(store.begin_sweep(5000 + GRACE - 1, GRACE).is_empty());
        let picked = store.begin_sweep(5000 + GRACE, GRACE);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].share_id, id(1, 0));
    }

    #[test]
    fn test_sweep_picks_each_share_once() {
        let store = LeaseStore::in_memory();
        store.add_lease(id(1, 0), ObjectKind::Immutable, 10, owner(1), 100);
        store.add_lease(id(1, 1), ObjectKind::Immutable, 10, owner(1), 100);

        assert_eq!(store.begin_sweep(10_000, GRACE).len(), 2);
        assert!(store.begin_sweep(10_000, GRACE).is_empty(), "already marked");
        store.finish_reclaim(id(1, 0));
        store.abort_reclaim(id(1, 1));
        assert!(store.record(id(1, 0)).is_none());
        assert_eq!(store.begin_sweep(10_000, GRACE).len(), 1, "aborted share retried");
    }

    #[test]
    fn test_renew_before_and_after_sweep() {
        let store = LeaseStore::in_memory();
        store.add_lease(id(2, 0), ObjectKind::Immutable, 10, owner(1), 100);

        // renewal before the sweep keeps the share
        assert_eq!(store.renew(id(2, 0), &owner(1), 10_000).unwrap(), 10_000);
        assert!(store.begin_sweep(500, GRACE).is_empty());

        // expire again, sweep marks it, renewal now fails
        assert_eq!(store.begin_sweep(20_000, GRACE).len(), 1);
        assert!(matches!(
            store.renew(id(2, 0), &owner(1), 30_000),
            Err(GridError::ShareNotFound(_))
        ));
        // and a put during reclamation is refused
        assert_eq!(
            store.add_lease(id(2, 0), ObjectKind::Immutable, 10, owner(3), 30_000),
            AddLease::Reclaiming
        );
    }

    #[test]
    fn test_renew_unknown_owner_or_share() {
        let store = LeaseStore::in_memory();
        assert!(store.renew(id(3, 0), &owner(1), 10).is_err());
        store.add_lease(id(3, 0), ObjectKind::Immutable, 10, owner(1), 100);
        assert!(store.renew(id(3, 0), &owner(2), 200).is_err());
        let record = store.record(id(3, 0)).unwrap();
        assert_eq!(record.leases[0].renewals, 0);
    }

    #[test]
    fn test_cancel_then_delete_if_unleased() {
        let store = LeaseStore::in_memory();
        store.add_lease(id(4, 0), ObjectKind::Immutable, 10, owner(1), 1000);
        assert_eq!(store.mark_unleased_for_reclaim(id(4, 0), 10), ReclaimMark::StillLeased);
        assert!(store.cancel(id(4, 0), &owner(1)).unwrap());
        assert!(!store.cancel(id(4, 0), &owner(1)).unwrap());
        assert!(matches!(
            store.mark_unleased_for_reclaim(id(4, 0), 10),
            ReclaimMark::Marked { size: 10, .. }
        ));
        assert_eq!(store.mark_unleased_for_reclaim(id(4, 0), 10), ReclaimMark::Missing);
    }

    #[test]
    fn test_version_check_is_strict() {
        let store = LeaseStore::in_memory();
        let slot = id(5, 2);
        assert_eq!(store.check_version(slot, 1), VersionCheck::Newer);
        store.record_version(slot, 3, 50, owner(1), 1000);
        assert_eq!(store.check_version(slot, 3), VersionCheck::Stale { current: 3 });
        assert_eq!(store.check_version(slot, 2), VersionCheck::Stale { current: 3 });
        assert_eq!(store.check_version(slot, 4), VersionCheck::Newer);
        store.record_version(slot, 4, 60, owner(1), 2000);
        let record = store.record(slot).unwrap();
        assert_eq!(record.version, Some(4));
        assert_eq!(record.leases.len(), 1);
        assert_eq!(store.shares_for(&StorageIndex([5; 32]), ObjectKind::Mutable), vec![(2, Some(4))]);
    }

    #[test]
    fn test_version_not_recorded_on_a_slot_being_reclaimed() {
        let store = LeaseStore::in_memory();
        let slot = id(5, 3);
        assert_eq!(store.record_version(slot, 1, 50, owner(1), 100), AddLease::Created);

        // The writer checked the version while the slot was live...
        assert_eq!(store.check_version(slot, 2), VersionCheck::Newer);
        // ...then the collector marked it before the write landed.
        assert_eq!(store.begin_sweep(10_000, GRACE).len(), 1);
        assert_eq!(
            store.record_version(slot, 2, 60, owner(1), 20_000),
            AddLease::Reclaiming
        );
        let record = store.record(slot).unwrap();
        assert_eq!(record.version, Some(1), "marked slot left untouched");
        assert_eq!(record.state, ShareState::Reclaiming);

        // Once the record is gone a fresh write starts a new slot.
        store.finish_reclaim(slot);
        assert_eq!(store.record_version(slot, 2, 60, owner(1), 20_000), AddLease::Created);
        assert_eq!(store.shares_for(&StorageIndex([5; 32]), ObjectKind::Mutable), vec![(3, Some(2))]);
    }

    #[test]
    fn test_refused_puts_leave_table_clean() {
        let dir = TempDir::new().unwrap();
        let store = LeaseStore::open(&dir.path().join("leases.json")).unwrap();
        store.add_lease(id(10, 0), ObjectKind::Immutable, 5, owner(1), 100);
        store.begin_sweep(10_000, GRACE);
        store.flush().unwrap();
        assert!(!store.lock().dirty);

        assert_eq!(
            store.add_lease(id(10, 0), ObjectKind::Immutable, 5, owner(2), 20_000),
            AddLease::Reclaiming
        );
        assert_eq!(
            store.record_version(id(10, 0), 9, 5, owner(2), 20_000),
            AddLease::Reclaiming
        );
        assert!(!store.lock().dirty, "nothing changed, nothing to flush");

        store.add_lease(id(10, 1), ObjectKind::Immutable, 5, owner(2), 20_000);
        assert!(store.lock().dirty);
    }

    #[test]
    fn test_shares_for_filters_object_and_state() {
        let store = LeaseStore::in_memory();
        store.add_lease(id(6, 0), ObjectKind::Immutable, 1, owner(1), 10);
        store.add_lease(id(6, 4), ObjectKind::Immutable, 1, owner(1), 10_000);
        store.add_lease(id(7, 1), ObjectKind::Immutable, 1, owner(1), 10_000);
        store.begin_sweep(1000, GRACE);

        let live = store.shares_for(&StorageIndex([6; 32]), ObjectKind::Immutable);
        assert_eq!(live, vec![(4, None)]);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leases.json");
        {
            let store = LeaseStore::open(&path).unwrap();
            store.add_lease(id(8, 0), ObjectKind::Immutable, 42, owner(1), 1000);
            store.record_version(id(9, 1), 7, 99, owner(2), 2000);
            store.begin_sweep(5000, GRACE);
            store.flush().unwrap();
        }
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = LeaseStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        let record = reopened.record(id(9, 1)).unwrap();
        assert_eq!(record.version, Some(7));
        // marks from an interrupted sweep don't survive a restart
        assert_eq!(record.state, ShareState::Live);
        assert_eq!(reopened.stats().bytes, 141);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(10);
        assert_eq!(clock.now(), 10);
        assert!(SystemClock.now() > 1_600_000_000);
    }
}
