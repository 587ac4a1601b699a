//! Domain-separated BLAKE3 hashing for blocks, segments, tree nodes and
//! object descriptors.
//!
//! Every hash is computed in BLAKE3's derive-key mode with a fixed context
//! string, so a block hash can never be confused with a tree node or a
//! descriptor hash of the same bytes.

use tessera_core::{GridError, GridResult};

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

pub const BLOCK_CONTEXT: &str = "tessera 2024 block hash";
pub const SEGMENT_CONTEXT: &str = "tessera 2024 ciphertext segment hash";
pub const NODE_CONTEXT: &str = "tessera 2024 merkle interior node";
pub const EMPTY_LEAF_CONTEXT: &str = "tessera 2024 merkle empty leaf";
pub const DESCRIPTOR_CONTEXT: &str = "tessera 2024 object descriptor";

/// Hash `data` under a fixed context string.
pub fn tagged_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    hasher.finalize()
}

pub fn block_hash(block: &[u8]) -> Hash {
    tagged_hash(BLOCK_CONTEXT, block)
}

pub fn segment_hash(segment: &[u8]) -> Hash {
    tagged_hash(SEGMENT_CONTEXT, segment)
}

/// Interior node of a hash tree: H(left || right)
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(NODE_CONTEXT);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize()
}

/// Padding leaf used to fill a tree up to a power of two
pub fn empty_leaf() -> Hash {
    tagged_hash(EMPTY_LEAF_CONTEXT, b"")
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> GridResult<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| GridError::Codec(format!("invalid BLAKE3 hex '{hex}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn contexts_separate_domains() {
        let data = b"same bytes";
        assert_ne!(block_hash(data), segment_hash(data));
        assert_ne!(block_hash(data), tagged_hash(DESCRIPTOR_CONTEXT, data));
    }

    #[test]
    fn node_hash_is_order_sensitive() {
        let a = block_hash(b"a");
        let b = block_hash(b"b");
        assert_ne!(node_hash(&a, &b), node_hash(&b, &a));
    }

    #[test]
    fn hash_hex_roundtrip() {
        let h = block_hash(b"hello tessera");
        let hex = hash_to_hex(&h);
        assert_eq!(hex.len(), 64);
        assert_eq!(hash_from_hex(&hex).unwrap(), h);
        assert!(hash_from_hex("not hex").is_err());
    }

    proptest! {
        #[test]
        fn block_hash_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            prop_assert_eq!(block_hash(&data), block_hash(&data));
        }
    }
}
