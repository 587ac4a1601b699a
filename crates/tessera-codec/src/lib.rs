//! tessera-codec: erasure coding, share layout, and BLAKE3 integrity trees
//!
//! # Overview
//! - `erasure`: systematic k-of-n Reed-Solomon over one segment
//! - `hash`: domain-separated BLAKE3 for blocks, segments, nodes, descriptors
//! - `merkle`: power-of-two hash trees with branch proofs
//! - `share`: object descriptor, share wire format, `encode`/`decode`

pub mod erasure;
pub mod hash;
pub mod merkle;
pub mod share;

pub use erasure::ErasureCoder;
pub use hash::{hash_from_hex, hash_to_hex, Hash};
pub use merkle::{MerkleProof, MerkleTree};
pub use share::{decode, encode, EncodedObject, ObjectDescriptor, ObjectRef, Share};
