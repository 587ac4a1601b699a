use thiserror::Error;

use crate::types::ShareNum;

pub type GridResult<T> = Result<T, GridError>;

/// Failure taxonomy shared by every layer of the grid.
///
/// Only exhaustion-class (`InsufficientShares`), authentication-class,
/// `WriteConflict`, `ShareNotFound` and `Cancelled` are expected to reach a
/// caller; `CorruptShare` and `PeerUnavailable` are absorbed by the
/// coordinator while candidates remain.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares { have: usize, need: usize },

    #[error("corrupt share {share}: {reason}")]
    CorruptShare { share: ShareNum, reason: String },

    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("write conflict at version {version}: {accepted} of {needed} shares accepted")]
    WriteConflict {
        version: u64,
        accepted: usize,
        needed: usize,
    },

    #[error("peer {peer} unavailable: {reason}")]
    PeerUnavailable { peer: String, reason: String },

    #[error("share not found: {0}")]
    ShareNotFound(String),

    #[error("mismatched encoding parameters: expected {expected}, got {actual}")]
    MismatchedParams { expected: String, actual: String },

    #[error("invalid encoding parameters: {0}")]
    InvalidParams(String),

    #[error("invalid capability: {0}")]
    InvalidCapability(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GridError {
    pub fn peer_unavailable(peer: impl ToString, reason: impl ToString) -> Self {
        GridError::PeerUnavailable {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(share: ShareNum, reason: impl Into<String>) -> Self {
        GridError::CorruptShare {
            share,
            reason: reason.into(),
        }
    }

    /// True for failures the coordinator retries against the next candidate.
    pub fn is_transient(&self) -> bool {
        matches!(self, GridError::PeerUnavailable { .. })
    }
}
