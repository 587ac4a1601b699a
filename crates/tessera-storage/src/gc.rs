//! Lease-expiry crawler
//!
//! A sweep marks every expired share under the lease-table lock, deletes
//! the bytes with no lock held, then drops the records. A share whose
//! bytes fail to delete is put back and retried by the next sweep.

use opendal::Operator;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{GridResult, LeaseOwner, ShareId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{Clock, LeaseStore};
use crate::server::{share_path, StorageServer};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub bytes: u64,
    /// Shares whose bytes could not be deleted this round
    pub failed: usize,
}

pub struct Collector {
    op: Operator,
    leases: Arc<LeaseStore>,
    grace_period_secs: u64,
}

impl Collector {
    pub fn new(op: Operator, leases: Arc<LeaseStore>, grace_period_secs: u64) -> Self {
        Self {
            op,
            leases,
            grace_period_secs,
        }
    }

    /// Collector over the same operator and lease table as `server`.
    pub fn for_server(server: &StorageServer, grace_period_secs: u64) -> Self {
        Self::new(server.operator().clone(), server.leases().clone(), grace_period_secs)
    }

    /// Extend a lease; `ShareNotFound` once the share has been picked by a sweep.
    pub fn renew(&self, id: ShareId, owner: &LeaseOwner, expires_at: u64) -> GridResult<u64> {
        self.leases.renew(id, owner, expires_at)
    }

    /// Reclaim every share whose leases all ended at least one grace period
    /// before `now`.
    pub async fn expire_sweep(&self, now: u64) -> SweepReport {
        let candidates = self.leases.begin_sweep(now, self.grace_period_secs);
        let mut report = SweepReport::default();

        for candidate in candidates {
            let path = share_path(&candidate.share_id, candidate.kind);
            match StorageServer::delete_bytes(&self.op, &path).await {
                Ok(()) => {
                    self.leases.finish_reclaim(candidate.share_id);
                    report.reclaimed += 1;
                    report.bytes += candidate.size;
                    debug!(share = %candidate.share_id, bytes = candidate.size, "reclaimed");
                }
                Err(e) => {
                    self.leases.abort_reclaim(candidate.share_id);
                    report.failed += 1;
                    warn!(share = %candidate.share_id, "reclaim failed: {e}");
                }
            }
        }

        if report.reclaimed > 0 || report.failed > 0 {
            info!(
                reclaimed = report.reclaimed,
                bytes = report.bytes,
                failed = report.failed,
                "expiry sweep complete"
            );
        }
        report
    }

    /// Sweep every `interval` until cancelled, flushing the lease table after
    /// each round. `on_sweep` sees every report (metrics hook).
    pub async fn run<F>(
        &self,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        mut on_sweep: F,
    ) where
        F: FnMut(&SweepReport) + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), grace_secs = self.grace_period_secs, "collector started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("collector shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.expire_sweep(clock.now()).await;
                    on_sweep(&report);
                    if let Err(e) = self.leases.flush() {
                        warn!("failed to flush lease table: {e}");
                    }
                }
            }
        }
    }
}
