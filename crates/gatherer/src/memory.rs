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

//! Estimates of heap usage, reported to the external resource monitor.

use rustc_hash::{FxHashMap, FxHashSet};

pub trait MemoryUsage {
    /// Approximate number of heap bytes owned by this value
    fn memory_usage(&self) -> usize;
}

pub(crate) fn map_usage<K, V>(map: &FxHashMap<K, V>) -> usize {
    // hashbrown keeps one control byte per bucket next to each entry
    map.capacity() * (std::mem::size_of::<(K, V)>() + 1)
}

pub(crate) fn set_usage<K>(set: &FxHashSet<K>) -> usize {
    set.capacity() * (std::mem::size_of::<K>() + 1)
}
