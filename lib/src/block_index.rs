// Copyright 2023 The Wrangle Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fanout hash index over one block.
//!
//! Layout: 256 x u32 cumulative fanout (`fanout[b]` = number of key digests
//! whose first byte is <= `b`), then N x 16-byte sorted key digests, then
//! N x u32 row offsets. The fanout bounds a lookup to the digests sharing
//! the key's first byte, so a lookup touches one small contiguous range.

use std::io::Cursor;

use crate::content_hash::HASH_LEN;
use crate::content_hash::HashSum;
use crate::encoding::DecodeError;
use crate::encoding::Parser;
use crate::encoding::StrListEncoder;
use crate::objects::Block;
use crate::objects::pk_sum;

const FANOUT_LEN: usize = 256;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BlockIndex {
    fanout: Vec<u32>,
    hashes: Vec<HashSum>,
    offsets: Vec<u32>,
}

impl BlockIndex {
    /// Builds the index for `block` keyed by the `pk` column indices.
    pub fn build(enc: &mut StrListEncoder, block: &Block, pk: &[u32]) -> Self {
        let mut pairs: Vec<(HashSum, u32)> = block
            .rows
            .iter()
            .enumerate()
            .map(|(offset, row)| (pk_sum(enc, row, pk), offset as u32))
            .collect();
        pairs.sort();
        let mut fanout = vec![0u32; FANOUT_LEN];
        for (hash, _) in &pairs {
            fanout[hash[0] as usize] += 1;
        }
        for b in 1..FANOUT_LEN {
            fanout[b] += fanout[b - 1];
        }
        let (hashes, offsets) = pairs.into_iter().unzip();
        Self {
            fanout,
            hashes,
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Row offset within the block for the given key digest.
    pub fn lookup(&self, hash: &HashSum) -> Option<u32> {
        let bucket = hash[0] as usize;
        let start = if bucket == 0 {
            0
        } else {
            self.fanout[bucket - 1] as usize
        };
        let end = self.fanout[bucket] as usize;
        let slot = self.hashes[start..end].binary_search(hash).ok()?;
        Some(self.offsets[start + slot])
    }

    /// Key digests in sorted order, paired with their row offsets.
    pub fn entries(&self) -> impl Iterator<Item = (&HashSum, u32)> + '_ {
        self.hashes.iter().zip(self.offsets.iter().copied())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FANOUT_LEN * 4 + self.hashes.len() * (HASH_LEN + 4));
        for &count in &self.fanout {
            out.extend_from_slice(&count.to_be_bytes());
        }
        for hash in &self.hashes {
            out.extend_from_slice(hash);
        }
        for &offset in &self.offsets {
            out.extend_from_slice(&offset.to_be_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut parser = Parser::new(Cursor::new(bytes));
        let mut fanout = Vec::with_capacity(FANOUT_LEN);
        for _ in 0..FANOUT_LEN {
            fanout.push(parser.read_u32()?);
        }
        if fanout.windows(2).any(|w| w[0] > w[1]) {
            return Err(parser.parse_error("fanout is not monotone"));
        }
        let count = fanout[FANOUT_LEN - 1] as usize;
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(parser.read_sum()?);
        }
        if hashes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(parser.parse_error("key digests are not strictly ascending"));
        }
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(parser.read_u32()?);
        }
        Ok(Self {
            fanout,
            hashes,
            offsets,
        })
    }
}
