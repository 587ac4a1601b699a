//! tessera-grid: client coordinator for placing and retrieving objects
//!
//! - `permute`: per-object peer order
//! - `placement`: concurrent share-to-peer assignment with fallback
//! - `upload` / `download`: immutable objects
//! - `mutable`: signed, versioned objects
//! - `health`: verification sweeps and lease renewal
//! - `state`: operation phase tracking

pub mod download;
pub mod grid;
pub mod health;
pub mod mutable;
pub mod permute;
pub mod placement;
pub mod state;
pub mod upload;

pub use grid::{Grid, GridOptions};
pub use health::{HealthReport, RenewReport};
pub use permute::{peer_rank, permute_ids};
pub use state::{OpKind, OpTracker, Phase};
