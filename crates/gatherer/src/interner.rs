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

//! Interning of influencer field values.
//!
//! The same field value typically recurs across many entities and buckets, so
//! values are stored once as `Arc<str>` and shared. Equality and hashing of
//! `Arc<str>` are by content, which is what keys in the aggregate maps need.

use rustc_hash::FxHashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StringStore {
    strings: FxHashSet<Arc<str>>,
}

impl StringStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the canonical shared copy of `value`, adding it if needed
    pub fn get(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(value);
        self.strings.insert(Arc::clone(&interned));
        interned
    }

    /// Canonicalise an already shared string
    pub fn canonical(&mut self, value: &Arc<str>) -> Arc<str> {
        if let Some(existing) = self.strings.get(value.as_ref()) {
            return Arc::clone(existing);
        }
        self.strings.insert(Arc::clone(value));
        Arc::clone(value)
    }

    /// Drop strings no longer referenced outside the store, returning how many
    /// were dropped
    pub fn prune(&mut self) -> usize {
        let before = self.strings.len();
        self.strings.retain(|s| Arc::strong_count(s) > 1);
        before - self.strings.len()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.strings.capacity() * std::mem::size_of::<Arc<str>>()
            + self.strings.iter().map(|s| s.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_are_shared() {
        let mut store = StringStore::new();
        let a = store.get("host-1");
        let b = store.get("host-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);

        let outside: Arc<str> = Arc::from("host-1");
        let c = store.canonical(&outside);
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_prune_drops_unreferenced() {
        let mut store = StringStore::new();
        let kept = store.get("kept");
        {
            let _dropped = store.get("dropped");
        }
        assert_eq!(store.prune(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("kept").as_ref(), kept.as_ref());
    }
}
