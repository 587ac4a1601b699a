//! Share layout, object-level encode/decode, and share verification
//!
//! Ciphertext is cut into segments; every segment is erasure coded into n
//! blocks and share `i` holds block `i` of every segment. Two hash trees
//! make each share verifiable on its own:
//!
//! ```text
//! share tree  (root in descriptor)        segment tree (root in descriptor)
//!   leaf i = root of share i's block tree   leaf j = hash of ciphertext segment j
//! ```
//!
//! Each share carries its share-tree branch and the segment hashes. The
//! descriptor is copied into every share; its hash is what capabilities and
//! signed mutable headers commit to.
//!
//! Wire format (big-endian):
//! ```text
//! "TSHR" | version u8 | share_num u8 | descriptor (82 bytes)
//! sibling count u16 | siblings (32 bytes each)
//! segment count u32 | segment hashes (32 bytes each)
//! per segment: block len u32 | block bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tessera_core::{EncodingParams, GridError, GridResult, ShareNum};
use tracing::debug;

use crate::erasure::ErasureCoder;
use crate::hash::{block_hash, segment_hash, tagged_hash, Hash, DESCRIPTOR_CONTEXT};
use crate::merkle::{MerkleProof, MerkleTree};

pub const SHARE_MAGIC: &[u8; 4] = b"TSHR";
pub const SHARE_FORMAT_VERSION: u8 = 1;

/// Per-object metadata shared by all of its shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    pub params: EncodingParams,
    /// Ciphertext length in bytes
    pub size: u64,
    pub num_segments: u32,
    pub share_root: Hash,
    pub segment_root: Hash,
}

impl ObjectDescriptor {
    pub const ENCODED_LEN: usize = 1 + 1 + 4 + 8 + 4 + 32 + 32;

    pub fn segment_count_for(size: u64, segment_size: u32) -> u32 {
        size.div_ceil(segment_size as u64).max(1) as u32
    }

    /// Ciphertext bytes in segment `index`
    pub fn segment_len(&self, index: u32) -> usize {
        let seg = self.params.segment_size as u64;
        let start = index as u64 * seg;
        self.size.saturating_sub(start).min(seg) as usize
    }

    /// Bytes of each block of segment `index`
    pub fn block_len(&self, index: u32) -> usize {
        self.segment_len(index)
            .div_ceil(self.params.needed as usize)
            .max(1)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(self.params.needed);
        buf.put_u8(self.params.total);
        buf.put_u32(self.params.segment_size);
        buf.put_u64(self.size);
        buf.put_u32(self.num_segments);
        buf.put_slice(self.share_root.as_bytes());
        buf.put_slice(self.segment_root.as_bytes());
        buf
    }

    pub fn from_bytes(mut data: &[u8]) -> GridResult<Self> {
        ensure_remaining(&data, Self::ENCODED_LEN, "descriptor")?;
        let params = EncodingParams {
            needed: data.get_u8(),
            total: data.get_u8(),
            segment_size: data.get_u32(),
        };
        params.validate()?;
        let size = data.get_u64();
        let num_segments = data.get_u32();
        let share_root = read_hash(&mut data);
        let segment_root = read_hash(&mut data);
        let descriptor = Self {
            params,
            size,
            num_segments,
            share_root,
            segment_root,
        };
        if num_segments != Self::segment_count_for(size, params.segment_size) {
            return Err(GridError::Codec(format!(
                "descriptor claims {num_segments} segments for {size} bytes"
            )));
        }
        Ok(descriptor)
    }

    /// Integrity root committed to by capabilities and signed headers
    pub fn hash(&self) -> Hash {
        tagged_hash(DESCRIPTOR_CONTEXT, &self.to_bytes())
    }
}

/// What a reader expects of the shares it collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub descriptor_hash: Hash,
    pub needed: u8,
    pub total: u8,
    /// Ciphertext length in bytes
    pub size: u64,
}

impl ObjectRef {
    pub fn from_descriptor(descriptor: &ObjectDescriptor) -> Self {
        Self {
            descriptor_hash: descriptor.hash(),
            needed: descriptor.params.needed,
            total: descriptor.params.total,
            size: descriptor.size,
        }
    }
}

/// One erasure-coded, independently verifiable fragment of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub share_num: ShareNum,
    pub descriptor: ObjectDescriptor,
    /// Block `j` belongs to ciphertext segment `j`
    pub blocks: Vec<Vec<u8>>,
    pub share_proof: MerkleProof,
    pub segment_hashes: Vec<Hash>,
}

impl Share {
    /// Root of this share's block tree; its leaf in the share tree.
    pub fn block_root(&self) -> Hash {
        let leaves: Vec<Hash> = self.blocks.iter().map(|b| block_hash(b)).collect();
        MerkleTree::new(&leaves).root()
    }

    /// Check this share against what the reader expects, then against its
    /// own descriptor. Fails with `MismatchedParams` or `CorruptShare`.
    pub fn verify(&self, target: &ObjectRef) -> GridResult<()> {
        let params = &self.descriptor.params;
        if params.needed != target.needed || params.total != target.total {
            return Err(GridError::MismatchedParams {
                expected: format!("{}-of-{}", target.needed, target.total),
                actual: params.to_string(),
            });
        }
        if self.descriptor.size != target.size {
            return Err(GridError::corrupt(
                self.share_num,
                format!(
                    "size {} does not match expected {}",
                    self.descriptor.size, target.size
                ),
            ));
        }
        if self.descriptor.hash() != target.descriptor_hash {
            return Err(GridError::corrupt(self.share_num, "descriptor hash mismatch"));
        }
        self.verify_integrity()
    }

    /// Internal consistency: shape, segment tree, and block tree under the share root.
    pub fn verify_integrity(&self) -> GridResult<()> {
        let d = &self.descriptor;
        let num = self.share_num;
        if num >= d.params.total {
            return Err(GridError::corrupt(num, format!("share number out of range (n={})", d.params.total)));
        }
        if self.blocks.len() != d.num_segments as usize {
            return Err(GridError::corrupt(
                num,
                format!("{} blocks for {} segments", self.blocks.len(), d.num_segments),
            ));
        }
        for (j, block) in self.blocks.iter().enumerate() {
            let expected = d.block_len(j as u32);
            if block.len() != expected {
                return Err(GridError::corrupt(
                    num,
                    format!("block {j} is {} bytes, expected {expected}", block.len()),
                ));
            }
        }
        if self.segment_hashes.len() != d.num_segments as usize
            || MerkleTree::new(&self.segment_hashes).root() != d.segment_root
        {
            return Err(GridError::corrupt(num, "segment hashes do not match segment root"));
        }
        if self.share_proof.index != num as usize
            || !self.share_proof.verify(&self.block_root(), &d.share_root)
        {
            return Err(GridError::corrupt(num, "block tree not under share root"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Bytes {
        let block_bytes: usize = self.blocks.iter().map(|b| b.len() + 4).sum();
        let mut buf = BytesMut::with_capacity(
            6 + ObjectDescriptor::ENCODED_LEN
                + 2
                + 32 * self.share_proof.siblings.len()
                + 4
                + 32 * self.segment_hashes.len()
                + block_bytes,
        );
        buf.put_slice(SHARE_MAGIC);
        buf.put_u8(SHARE_FORMAT_VERSION);
        buf.put_u8(self.share_num);
        buf.put_slice(&self.descriptor.to_bytes());
        buf.put_u16(self.share_proof.siblings.len() as u16);
        for h in &self.share_proof.siblings {
            buf.put_slice(h.as_bytes());
        }
        buf.put_u32(self.segment_hashes.len() as u32);
        for h in &self.segment_hashes {
            buf.put_slice(h.as_bytes());
        }
        for block in &self.blocks {
            buf.put_u32(block.len() as u32);
            buf.put_slice(block);
        }
        buf.freeze()
    }

    /// Parse the wire format. Structural errors only; call [`Share::verify`]
    /// before trusting the contents.
    pub fn from_bytes(mut data: &[u8]) -> GridResult<Self> {
        ensure_remaining(&data, 6, "share header")?;
        if &data[..4] != SHARE_MAGIC {
            return Err(GridError::Codec("not a share (bad magic)".into()));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != SHARE_FORMAT_VERSION {
            return Err(GridError::Codec(format!("unsupported share format v{version}")));
        }
        let share_num = data.get_u8();
        let descriptor = ObjectDescriptor::from_bytes(data)?;
        data.advance(ObjectDescriptor::ENCODED_LEN);

        ensure_remaining(&data, 2, "proof length")?;
        let sibling_count = data.get_u16() as usize;
        ensure_remaining(&data, sibling_count * 32, "proof")?;
        let siblings = (0..sibling_count).map(|_| read_hash(&mut data)).collect();

        ensure_remaining(&data, 4, "segment hash count")?;
        let segment_count = data.get_u32() as usize;
        if segment_count != descriptor.num_segments as usize {
            return Err(GridError::Codec(format!(
                "{segment_count} segment hashes for {} segments",
                descriptor.num_segments
            )));
        }
        ensure_remaining(&data, segment_count * 32, "segment hashes")?;
        let segment_hashes = (0..segment_count).map(|_| read_hash(&mut data)).collect();

        let mut blocks = Vec::with_capacity(segment_count);
        for j in 0..segment_count {
            ensure_remaining(&data, 4, "block length")?;
            let len = data.get_u32() as usize;
            ensure_remaining(&data, len, &format!("block {j}"))?;
            blocks.push(data[..len].to_vec());
            data.advance(len);
        }
        if data.has_remaining() {
            return Err(GridError::Codec(format!(
                "{} trailing bytes after share",
                data.remaining()
            )));
        }

        Ok(Self {
            share_num,
            descriptor,
            blocks,
            share_proof: MerkleProof {
                index: share_num as usize,
                siblings,
            },
            segment_hashes,
        })
    }
}

/// Output of [`encode`]: the descriptor plus all n shares in order.
#[derive(Debug, Clone)]
pub struct EncodedObject {
    pub descriptor: ObjectDescriptor,
    pub shares: Vec<Share>,
}

impl EncodedObject {
    pub fn descriptor_hash(&self) -> Hash {
        self.descriptor.hash()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::from_descriptor(&self.descriptor)
    }
}

/// Erasure code `ciphertext` into `n` shares, any `k` of which rebuild it.
pub fn encode(ciphertext: &[u8], params: &EncodingParams) -> GridResult<EncodedObject> {
    let coder = ErasureCoder::new(params)?;
    let total = params.total as usize;

    let segments: Vec<&[u8]> = if ciphertext.is_empty() {
        vec![&[][..]]
    } else {
        ciphertext.chunks(params.segment_size as usize).collect()
    };

    let coded: Vec<(Hash, Vec<Vec<u8>>)> = segments
        .par_iter()
        .map(|seg| Ok((segment_hash(seg), coder.encode_segment(seg)?)))
        .collect::<GridResult<_>>()?;

    let mut segment_hashes = Vec::with_capacity(coded.len());
    let mut share_blocks: Vec<Vec<Vec<u8>>> = vec![Vec::with_capacity(coded.len()); total];
    for (hash, blocks) in coded {
        segment_hashes.push(hash);
        for (i, block) in blocks.into_iter().enumerate() {
            share_blocks[i].push(block);
        }
    }

    let block_roots: Vec<Hash> = share_blocks
        .par_iter()
        .map(|blocks| {
            let leaves: Vec<Hash> = blocks.iter().map(|b| block_hash(b)).collect();
            MerkleTree::new(&leaves).root()
        })
        .collect();

    let share_tree = MerkleTree::new(&block_roots);
    let segment_tree = MerkleTree::new(&segment_hashes);

    let descriptor = ObjectDescriptor {
        params: *params,
        size: ciphertext.len() as u64,
        num_segments: segment_hashes.len() as u32,
        share_root: share_tree.root(),
        segment_root: segment_tree.root(),
    };

    let mut shares = Vec::with_capacity(total);
    for (i, blocks) in share_blocks.into_iter().enumerate() {
        let share_proof = share_tree
            .proof(i)
            .ok_or_else(|| GridError::Codec(format!("no share-tree proof for share {i}")))?;
        shares.push(Share {
            share_num: i as ShareNum,
            descriptor: descriptor.clone(),
            blocks,
            share_proof,
            segment_hashes: segment_hashes.clone(),
        });
    }

    debug!(
        bytes = ciphertext.len(),
        segments = descriptor.num_segments,
        params = %params,
        "encoded object"
    );

    Ok(EncodedObject { descriptor, shares })
}

/// Rebuild ciphertext from at least k shares of the object `target` names.
///
/// Every supplied share is verified first; a single bad share fails the call
/// with `CorruptShare` (callers that want to skip bad shares verify them
/// individually beforehand). Duplicate share numbers are ignored.
pub fn decode(shares: &[Share], target: &ObjectRef) -> GridResult<Vec<u8>> {
    if target.needed == 0 || target.needed > target.total {
        return Err(GridError::InvalidParams(format!(
            "cannot decode {}-of-{}",
            target.needed, target.total
        )));
    }
    for share in shares {
        share.verify(target)?;
    }

    let mut by_num: BTreeMap<ShareNum, &Share> = BTreeMap::new();
    for share in shares {
        by_num.entry(share.share_num).or_insert(share);
    }
    let needed = target.needed as usize;
    if by_num.len() < needed {
        return Err(GridError::InsufficientShares {
            have: by_num.len(),
            need: needed,
        });
    }

    // Lowest share numbers first: with all data shares present nothing is reconstructed.
    let chosen: Vec<&Share> = by_num.values().copied().take(needed).collect();
    let descriptor = &chosen[0].descriptor;
    let segment_hashes = &chosen[0].segment_hashes;
    let coder = ErasureCoder::new(&descriptor.params)?;
    let total = descriptor.params.total as usize;

    let segments: Vec<Vec<u8>> = (0..descriptor.num_segments)
        .into_par_iter()
        .map(|j| {
            let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
            for share in &chosen {
                slots[share.share_num as usize] = Some(share.blocks[j as usize].clone());
            }
            let segment = coder.decode_segment(slots, descriptor.segment_len(j))?;
            if segment_hash(&segment) != segment_hashes[j as usize] {
                return Err(GridError::Codec(format!(
                    "segment {j} failed its ciphertext hash check"
                )));
            }
            Ok(segment)
        })
        .collect::<GridResult<_>>()?;

    let mut ciphertext = Vec::with_capacity(descriptor.size as usize);
    for segment in segments {
        ciphertext.extend_from_slice(&segment);
    }
    if ciphertext.len() as u64 != target.size {
        return Err(GridError::Codec(format!(
            "decoded {} bytes, expected {}",
            ciphertext.len(),
            target.size
        )));
    }
    Ok(ciphertext)
}

fn ensure_remaining(data: &&[u8], n: usize, what: &str) -> GridResult<()> {
    if data.len() < n {
        return Err(GridError::Codec(format!(
            "truncated {what}: need {n} bytes, have {}",
            data.len()
        )));
    }
    Ok(())
}

fn read_hash(data: &mut &[u8]) -> Hash {
    let mut bytes = [0u8; 32];
    data.copy_to_slice(&mut bytes);
    Hash::from(bytes)
}
