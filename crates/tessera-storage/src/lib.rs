//! tessera-storage: the storage-node side of the grid
//!
//! - `protocol`: the `StorageNode` trait clients talk to
//! - `server`: in-process node over an OpenDAL operator
//! - `lease`: the lease table (one lock, optional JSON persistence)
//! - `gc`: expiry sweeps and the periodic crawler
//! - `operator`: memory / fs / S3 backends
//! - `health`: backend write-read-delete probe

pub mod gc;
pub mod health;
pub mod lease;
pub mod operator;
pub mod protocol;
pub mod server;

pub use gc::{Collector, SweepReport};
pub use health::{check_health, is_healthy};
pub use lease::{Clock, LeaseStore, ManualClock, SystemClock};
pub use operator::{build_operator, S3Credentials};
pub use protocol::{
    DeleteOutcome, MutableOutcome, MutableSlot, NodeStats, PutOutcome, StorageNode,
};
pub use server::{ServerConfig, StorageServer};
