//! Object health checks and client-side lease renewal

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tessera_codec::{ObjectRef, Share};
use tessera_core::{GridError, GridResult, ObjectKind, PeerId, ShareId, ShareNum, StorageIndex};
use tessera_crypto::Capability;
use tessera_storage::StorageNode;
use tracing::{debug, info, warn};

use crate::download::immutable_target;
use crate::grid::Grid;

/// Where an object's shares live and how many of them verify.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub storage_index: StorageIndex,
    pub kind: ObjectKind,
    pub needed: usize,
    pub total: usize,
    /// Version the report describes (mutable objects only)
    pub version: Option<u64>,
    /// Distinct share numbers that verified somewhere
    pub live_shares: usize,
    pub locations: BTreeMap<ShareNum, Vec<PeerId>>,
    pub corrupt: Vec<(PeerId, ShareNum)>,
    pub unreachable: Vec<PeerId>,
}

impl HealthReport {
    pub fn is_recoverable(&self) -> bool {
        self.live_shares >= self.needed
    }

    pub fn is_healthy(&self) -> bool {
        self.live_shares >= self.total
    }

    /// Share numbers no reachable peer holds a good copy of.
    pub fn missing(&self) -> Vec<ShareNum> {
        (0..self.total)
            .filter_map(|n| ShareNum::try_from(n).ok())
            .filter(|n| !self.locations.contains_key(n))
            .collect()
    }
}

/// Outcome of re-leasing an object's shares.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewReport {
    pub renewed: usize,
    /// Earliest of the new expiries
    pub expires_at: Option<u64>,
    /// Shares a peer listed but would not renew: collected, or never ours
    pub lost: Vec<(PeerId, ShareNum)>,
    pub unreachable: Vec<PeerId>,
    /// Share numbers with no renewed copy anywhere
    pub missing: Vec<ShareNum>,
}

enum PeerInventory {
    Unreachable,
    Shares(Vec<(ShareNum, GridResult<()>)>),
}

/// Fetch and verify every share `node` holds for an immutable object.
async fn inspect_peer(
    node: Arc<dyn StorageNode>,
    storage_index: StorageIndex,
    target: ObjectRef,
) -> PeerInventory {
    let listed = match node.list_shares(storage_index).await {
        Ok(listed) => listed,
        Err(e) => {
            debug!(peer = %node.peer_id().short(), "list failed: {e}");
            return PeerInventory::Unreachable;
        }
    };
    let mut found = Vec::with_capacity(listed.len());
    for num in listed {
        let verdict = match node.get(ShareId::new(storage_index, num)).await {
            Ok(Some(bytes)) => Share::from_bytes(&bytes).and_then(|share| {
                if share.share_num != num {
                    return Err(GridError::corrupt(num, "served under the wrong number"));
                }
                share.verify(&target)
            }),
            Ok(None) => continue,
            Err(e) => Err(e),
        };
        found.push((num, verdict));
    }
    PeerInventory::Shares(found)
}

impl Grid {
    /// Verify every share of the object on every peer.
    ///
    /// Needs only a verify cap; stronger caps are narrowed first.
    pub async fn check(&self, cap: &Capability) -> GridResult<HealthReport> {
        match cap.to_verify_cap()? {
            Capability::ImmutableVerify {
                storage_index,
                descriptor_hash,
                needed,
                total,
                size,
            } => {
                let target = immutable_target(descriptor_hash, needed, total, size)?;
                Ok(self.check_immutable(storage_index, target).await)
            }
            Capability::MutableVerify { verifying_key } => {
                let storage_index = cap.storage_index()?;
                let survey = self.survey_slots(storage_index, verifying_key).await;
                let peers = self.peers_for(&storage_index);
                let id = |i: &usize| peers[*i].peer_id();

                let mut report = HealthReport {
                    storage_index,
                    kind: ObjectKind::Mutable,
                    needed: self.options().params.needed as usize,
                    total: self.options().params.total as usize,
                    version: None,
                    live_shares: 0,
                    locations: BTreeMap::new(),
                    corrupt: survey.corrupt.iter().map(|(p, n)| (id(p), *n)).collect(),
                    unreachable: survey.unreachable.iter().map(id).collect(),
                };
                if let Some(group) = survey.newest() {
                    report.needed = group.target.needed as usize;
                    report.total = group.target.total as usize;
                    report.version = Some(group.header.version);
                    report.live_shares = group.shares.len();
                    report.locations = group
                        .holders
                        .iter()
                        .map(|(num, holders)| (*num, holders.iter().map(id).collect()))
                        .collect();
                }
                log_report(&report);
                Ok(report)
            }
            _ => Err(GridError::InvalidCapability(
                "to_verify_cap returned a non-verify cap".into(),
            )),
        }
    }

    async fn check_immutable(&self, storage_index: StorageIndex, target: ObjectRef) -> HealthReport {
        let peers = self.peers_for(&storage_index);
        let inventories = join_all(
            peers
                .iter()
                .map(|node| inspect_peer(Arc::clone(node), storage_index, target)),
        )
        .await;

        let mut report = HealthReport {
            storage_index,
            kind: ObjectKind::Immutable,
            needed: target.needed as usize,
            total: target.total as usize,
            version: None,
            live_shares: 0,
            locations: BTreeMap::new(),
            corrupt: Vec::new(),
            unreachable: Vec::new(),
        };
        for (node, inventory) in peers.iter().zip(inventories) {
            let peer = node.peer_id();
            let PeerInventory::Shares(found) = inventory else {
                report.unreachable.push(peer);
                continue;
            };
            for (num, verdict) in found {
                match verdict {
                    Ok(()) => report.locations.entry(num).or_default().push(peer),
                    Err(e) => {
                        warn!(peer = %peer.short(), share = num, "share failed verification: {e}");
                        report.corrupt.push((peer, num));
                    }
                }
            }
        }
        report.live_shares = report.locations.len();
        log_report(&report);
        report
    }

    /// Renew this client's lease on every share of the object, wherever
    /// it is held. Any capability for the object will do.
    pub async fn renew_leases(&self, cap: &Capability) -> GridResult<RenewReport> {
        let storage_index = cap.storage_index()?;
        let kind = cap.kind();
        let total = match cap {
            Capability::ImmutableRead { total, .. } | Capability::ImmutableVerify { total, .. } => {
                *total
            }
            _ => self.options().params.total,
        };
        let owner = self.options().lease_secret.lease_owner(&storage_index);
        let peers = self.peers_for(&storage_index);

        let per_peer = join_all(peers.iter().map(|node| {
            let node = Arc::clone(node);
            async move {
                let listed: GridResult<Vec<ShareNum>> = match kind {
                    ObjectKind::Immutable => node.list_shares(storage_index).await,
                    ObjectKind::Mutable => node
                        .list_slots(storage_index)
                        .await
                        .map(|slots| slots.into_iter().map(|(num, _)| num).collect()),
                };
                let listed = listed?;
                let mut results = Vec::with_capacity(listed.len());
                for num in listed {
                    let renewed = node.renew_lease(ShareId::new(storage_index, num), owner).await;
                    results.push((num, renewed));
                }
                Ok::<_, GridError>(results)
            }
        }))
        .await;

        let mut report = RenewReport::default();
        let mut covered = BTreeSet::new();
        for (node, outcome) in peers.iter().zip(per_peer) {
            let peer = node.peer_id();
            let results = match outcome {
                Ok(results) => results,
                Err(e) => {
                    debug!(peer = %peer.short(), "renew listing failed: {e}");
                    report.unreachable.push(peer);
                    continue;
                }
            };
            for (num, renewed) in results {
                match renewed {
                    Ok(expires_at) => {
                        report.renewed += 1;
                        covered.insert(num);
                        report.expires_at = Some(report.expires_at.map_or(expires_at, |e| e.min(expires_at)));
                    }
                    Err(GridError::ShareNotFound(reason)) => {
                        debug!(peer = %peer.short(), share = num, %reason, "renewal refused");
                        report.lost.push((peer, num));
                    }
                    Err(e) => {
                        warn!(peer = %peer.short(), share = num, "renewal failed: {e}");
                        report.lost.push((peer, num));
                    }
                }
            }
        }
        report.missing = (0..total).filter(|n| !covered.contains(n)).collect();
        info!(
            storage_index = %storage_index,
            renewed = report.renewed,
            lost = report.lost.len(),
            missing = report.missing.len(),
            "leases renewed"
        );
        Ok(report)
    }
}

fn log_report(report: &HealthReport) {
    if report.is_healthy() {
        debug!(storage_index = %report.storage_index, live = report.live_shares, "object healthy");
    } else {
        warn!(
            storage_index = %report.storage_index,
            live = report.live_shares,
            needed = report.needed,
            total = report.total,
            corrupt = report.corrupt.len(),
            recoverable = report.is_recoverable(),
            "object degraded"
        );
    }
}
