// Copyright (C) 2026-present The Sieve Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deterministic 64-bit checksums of gathered state.
//!
//! Hashing uses `FxHasher`, which is unseeded, so the same state gives the same
//! checksum across process restarts. Map and set contents are combined in an
//! order-independent way, sequences (e.g., the bucket queue) are combined in
//! order.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Types whose retained state can be summarised by a checksum
pub trait Checksum {
    fn checksum(&self) -> u64;
}

pub fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[inline]
pub fn combine(seed: u64, hash: u64) -> u64 {
    seed ^ hash
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Combine hashes in the order given
pub fn ordered<I: IntoIterator<Item = u64>>(seed: u64, hashes: I) -> u64 {
    hashes.into_iter().fold(seed, combine)
}

/// Combine hashes independently of the order given
pub fn unordered<I: IntoIterator<Item = u64>>(seed: u64, hashes: I) -> u64 {
    let mut hashes: Vec<u64> = hashes.into_iter().collect();
    hashes.sort_unstable();
    ordered(seed, hashes)
}

/// Hash a floating point value by its bit pattern
#[inline]
pub fn hash_f64(value: f64) -> u64 {
    hash_of(&value.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unordered_ignores_order() {
        let a = unordered(7, [hash_of("a"), hash_of("b"), hash_of("c")]);
        let b = unordered(7, [hash_of("c"), hash_of("a"), hash_of("b")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ordered_depends_on_order() {
        let a = ordered(7, [hash_of("a"), hash_of("b")]);
        let b = ordered(7, [hash_of("b"), hash_of("a")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_of(&(1u64, 2u64)), hash_of(&(1u64, 2u64)));
        assert_ne!(hash_f64(0.0), hash_f64(-0.0));
    }
}
