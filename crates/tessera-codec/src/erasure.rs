//! k-of-n Reed-Solomon coding of a single segment
//!
//! The code is systematic: blocks 0..k are the segment itself (zero padded
//! to `k * block_size`), blocks k..n are parity over GF(2^8). When k == n
//! there is no parity and the segment is simply striped.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tessera_core::{EncodingParams, GridError, GridResult};

pub struct ErasureCoder {
    needed: usize,
    total: usize,
    /// `None` when k == n (nothing to compute)
    rs: Option<ReedSolomon>,
}

impl ErasureCoder {
    pub fn new(params: &EncodingParams) -> GridResult<Self> {
        params.validate()?;
        let needed = params.needed as usize;
        let total = params.total as usize;
        let rs = if total > needed {
            Some(
                ReedSolomon::new(needed, total - needed)
                    .map_err(|e| GridError::InvalidParams(format!("{params}: {e:?}")))?,
            )
        } else {
            None
        };
        Ok(Self { needed, total, rs })
    }

    /// Bytes per block for a segment of `segment_len` bytes (never zero).
    pub fn block_size(&self, segment_len: usize) -> usize {
        segment_len.div_ceil(self.needed).max(1)
    }

    /// Split and extend one segment into `n` equally sized blocks.
    pub fn encode_segment(&self, segment: &[u8]) -> GridResult<Vec<Vec<u8>>> {
        let block_size = self.block_size(segment.len());
        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(self.total);
        for i in 0..self.needed {
            let start = (i * block_size).min(segment.len());
            let end = ((i + 1) * block_size).min(segment.len());
            let mut block = segment[start..end].to_vec();
            block.resize(block_size, 0);
            blocks.push(block);
        }
        blocks.resize(self.total, vec![0u8; block_size]);

        if let Some(rs) = &self.rs {
            rs.encode(&mut blocks)
                .map_err(|e| GridError::Codec(format!("reed-solomon encode: {e:?}")))?;
        }
        Ok(blocks)
    }

    /// Rebuild a segment of `segment_len` bytes from any k present blocks.
    ///
    /// `blocks` is indexed by share number; missing blocks are `None`.
    pub fn decode_segment(
        &self,
        mut blocks: Vec<Option<Vec<u8>>>,
        segment_len: usize,
    ) -> GridResult<Vec<u8>> {
        if blocks.len() != self.total {
            return Err(GridError::Codec(format!(
                "expected {} block slots, got {}",
                self.total,
                blocks.len()
            )));
        }
        let present = blocks.iter().filter(|b| b.is_some()).count();
        if present < self.needed {
            return Err(GridError::InsufficientShares {
                have: present,
                need: self.needed,
            });
        }

        let data_missing = blocks[..self.needed].iter().any(Option::is_none);
        if data_missing {
            let rs = self.rs.as_ref().ok_or_else(|| {
                GridError::Codec("data block missing with no parity available".into())
            })?;
            rs.reconstruct_data(&mut blocks)
                .map_err(|e| GridError::Codec(format!("reed-solomon reconstruct: {e:?}")))?;
        }

        let mut segment = Vec::with_capacity(segment_len);
        for block in blocks.into_iter().take(self.needed) {
            let block = block.ok_or_else(|| GridError::Codec("data block not rebuilt".into()))?;
            segment.extend_from_slice(&block);
        }
        segment.truncate(segment_len);
        Ok(segment)
    }
}
