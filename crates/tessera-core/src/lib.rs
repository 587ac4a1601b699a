pub mod config;
pub mod error;
pub mod types;

pub use error::{GridError, GridResult};
pub use types::{
    EncodingParams, LeaseOwner, ObjectKind, PeerId, ShareId, ShareNum, StorageIndex, MAX_SHARES,
};
