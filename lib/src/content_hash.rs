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

//! Content hashing for persisted objects and row keys.
//!
//! Every object id and every row key is the 128-bit BLAKE2b digest of the
//! object's canonical byte serialization. Recomputing the digest of stored
//! bytes must reproduce the storage key.

use blake2::Blake2b;
use blake2::Digest as _;
use digest::consts::U16;

/// Length in bytes of every digest produced by this module.
pub const HASH_LEN: usize = 16;

/// A raw 16-byte digest. Used on hot paths (sorting, fanout indexes) where
/// the typed id wrappers would allocate.
pub type HashSum = [u8; HASH_LEN];

type Blake2b128 = Blake2b<U16>;

/// The all-zero digest, used as the "absent" old value in reflogs and ref
/// update requests.
pub const ZERO_SUM: HashSum = [0; HASH_LEN];

pub fn hash_bytes(data: &[u8]) -> HashSum {
    let mut hasher = Blake2b128::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Incremental hasher with the same output as [`hash_bytes`].
#[derive(Default)]
pub struct Hasher(Blake2b128);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> HashSum {
        self.0.finalize().into()
    }
}

pub fn is_zero(sum: &[u8]) -> bool {
    sum.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_len() {
        assert_eq!(hash_bytes(b"abc").len(), HASH_LEN);
    }

    #[test]
    fn test_hash_stable() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), hash_bytes(b"hello world"));
    }

    #[test]
    fn test_zero_sum() {
        assert!(is_zero(&ZERO_SUM));
        assert!(!is_zero(&hash_bytes(b"")));
    }
}
