use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GridError, GridResult};

/// Index of a share within its object (0..n-1)
pub type ShareNum = u8;

/// Upper bound on `n`; share numbers must fit in a `ShareNum`.
pub const MAX_SHARES: u8 = 255;

/// Identifier peers use to address an object's shares.
///
/// Derived one-way from the object's key material, so holding it grants
/// nothing beyond locating and verifying shares.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageIndex(pub [u8; 32]);

impl StorageIndex {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageIndex({})", &self.to_hex()[..16])
    }
}

impl FromStr for StorageIndex {
    type Err = GridError;

    fn from_str(s: &str) -> GridResult<Self> {
        Ok(Self(decode_hex32(s)?))
    }
}

impl TryFrom<String> for StorageIndex {
    type Error = GridError;

    fn try_from(s: String) -> GridResult<Self> {
        s.parse()
    }
}

impl From<StorageIndex> for String {
    fn from(si: StorageIndex) -> String {
        si.to_hex()
    }
}

/// Address of one share on a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShareId {
    pub storage_index: StorageIndex,
    pub share_num: ShareNum,
}

impl ShareId {
    pub fn new(storage_index: StorageIndex, share_num: ShareNum) -> Self {
        Self {
            storage_index,
            share_num,
        }
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.storage_index, self.share_num)
    }
}

/// Identifier of a storage node, used as the permutation key for placement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Stable peer id for a human-readable node name.
    pub fn from_name(name: &str) -> Self {
        Self(blake3::derive_key("tessera peer id v1", name.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = GridError;

    fn from_str(s: &str) -> GridResult<Self> {
        Ok(Self(decode_hex32(s)?))
    }
}

impl TryFrom<String> for PeerId {
    type Error = GridError;

    fn try_from(s: String) -> GridResult<Self> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> String {
        p.to_string()
    }
}

/// Per-object lease owner secret. Whoever knows it may renew or cancel the
/// lease, so it is never logged in full.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LeaseOwner(pub [u8; 32]);

impl LeaseOwner {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseOwner({}…)", hex::encode(&self.0[..2]))
    }
}

impl TryFrom<String> for LeaseOwner {
    type Error = GridError;

    fn try_from(s: String) -> GridResult<Self> {
        Ok(Self(decode_hex32(&s)?))
    }
}

impl From<LeaseOwner> for String {
    fn from(o: LeaseOwner) -> String {
        hex::encode(&o.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Content-hash-keyed, convergent, never changes
    Immutable,
    /// Signed, versioned slot updated by the write-cap holder
    Mutable,
}

/// k-of-n encoding parameters, fixed per object at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodingParams {
    /// Shares needed to reconstruct (k)
    pub needed: u8,
    /// Shares produced (n)
    pub total: u8,
    /// Ciphertext bytes per segment
    pub segment_size: u32,
}

impl EncodingParams {
    pub const DEFAULT_SEGMENT_SIZE: u32 = 128 * 1024;

    pub fn new(needed: u8, total: u8) -> GridResult<Self> {
        let params = Self {
            needed,
            total,
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_segment_size(mut self, segment_size: u32) -> GridResult<Self> {
        self.segment_size = segment_size;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.needed == 0 {
            return Err(GridError::InvalidParams("k must be at least 1".into()));
        }
        if self.needed > self.total {
            return Err(GridError::InvalidParams(format!(
                "k ({}) exceeds n ({})",
                self.needed, self.total
            )));
        }
        if self.segment_size == 0 {
            return Err(GridError::InvalidParams("segment size must be non-zero".into()));
        }
        Ok(())
    }

    /// Canonical bytes mixed into convergent key derivation
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0] = self.needed;
        out[1] = self.total;
        out[2..].copy_from_slice(&self.segment_size.to_be_bytes());
        out
    }
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            needed: 3,
            total: 10,
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl fmt::Display for EncodingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{}", self.needed, self.total)
    }
}

/// Parse exactly 64 hex chars into 32 bytes
pub fn decode_hex32(s: &str) -> GridResult<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| GridError::Codec(format!("expected 64 hex chars: {e}")))?;
    Ok(out)
}
