//! Operation state tracking for placement and retrieval
//!
//! ```text
//! place:     Selecting → Uploading → Confirmed
//! retrieve:  Selecting → Querying  → Reconstructing → Done
//! any non-terminal state → Failed(reason)
//! ```
//!
//! The tracker exists for observability: each transition is logged with the
//! operation id and storage index, and illegal transitions are refused.

use std::fmt;
use tessera_core::{GridError, GridResult, StorageIndex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Place,
    Retrieve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Selecting,
    Uploading,
    Confirmed,
    Querying,
    Reconstructing,
    Done,
    Failed(String),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Confirmed | Phase::Done | Phase::Failed(_))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Selecting => f.write_str("selecting"),
            Phase::Uploading => f.write_str("uploading"),
            Phase::Confirmed => f.write_str("confirmed"),
            Phase::Querying => f.write_str("querying"),
            Phase::Reconstructing => f.write_str("reconstructing"),
            Phase::Done => f.write_str("done"),
            Phase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug)]
pub struct OpTracker {
    id: Uuid,
    kind: OpKind,
    storage_index: StorageIndex,
    phase: Phase,
}

impl OpTracker {
    pub fn new(kind: OpKind, storage_index: StorageIndex) -> Self {
        let id = Uuid::new_v4();
        debug!(op = %id, ?kind, storage_index = %storage_index, "operation started");
        Self {
            id,
            kind,
            storage_index,
            phase: Phase::Selecting,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Move to `next` if the transition is legal for this kind of operation.
    pub fn advance(&mut self, next: Phase) -> GridResult<()> {
        let legal = matches!(
            (self.kind, &self.phase, &next),
            (OpKind::Place, Phase::Selecting, Phase::Uploading)
                | (OpKind::Place, Phase::Uploading, Phase::Confirmed)
                | (OpKind::Retrieve, Phase::Selecting, Phase::Querying)
                | (OpKind::Retrieve, Phase::Querying, Phase::Reconstructing)
                | (OpKind::Retrieve, Phase::Reconstructing, Phase::Done)
        ) || (matches!(next, Phase::Failed(_)) && !self.phase.is_terminal());

        if !legal {
            return Err(GridError::Other(anyhow::anyhow!(
                "illegal {:?} transition {} → {}",
                self.kind,
                self.phase,
                next
            )));
        }

        if let Phase::Failed(reason) = &next {
            warn!(op = %self.id, storage_index = %self.storage_index, from = %self.phase, %reason, "operation failed");
        } else if next.is_terminal() {
            info!(op = %self.id, storage_index = %self.storage_index, phase = %next, "operation complete");
        } else {
            debug!(op = %self.id, storage_index = %self.storage_index, from = %self.phase, to = %next, "phase");
        }
        self.phase = next;
        Ok(())
    }

    /// Record `err` as the failure reason and hand it back for `?`.
    pub fn fail(&mut self, err: GridError) -> GridError {
        if !self.phase.is_terminal() {
            let _ = self.advance(Phase::Failed(err.to_string()));
        }
        err
    }
}
