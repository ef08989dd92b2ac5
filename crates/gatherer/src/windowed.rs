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

//! The retained buckets of one kind of per-pair data: the rolling queue of
//! single buckets together with the multi-bucket spans built from it.

use crate::bucket_queue::BucketQueue;
use crate::checksum::{self, Checksum};
use crate::error::PersistError;
use crate::memory::MemoryUsage;
use crate::overflow::{Merge, MultiBucketOverflow};
use crate::persist::{required, StateInserter, StateTraverser, Tag};
use crate::registry::PidCid;
use crate::time::{bucket_end, Time};

/// Per bucket data keyed by (person, attribute)
pub trait PairData: Default + Merge + Checksum + MemoryUsage {
    fn retain_pairs<F: Fn(PidCid) -> bool>(&mut self, keep: F);

    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowedBuckets<X> {
    queue: BucketQueue<X>,
    overflow: MultiBucketOverflow<X>,
}

impl<X: PairData> WindowedBuckets<X> {
    pub fn new(latency_buckets: usize, bucket_length: Time, latest: Time, spans: &[Time]) -> Self {
        Self {
            queue: BucketQueue::new(latency_buckets, bucket_length, latest),
            overflow: MultiBucketOverflow::new(spans),
        }
    }

    pub fn queue(&self) -> &BucketQueue<X> {
        &self.queue
    }

    pub fn start_new_bucket(&mut self, bucket_start: Time) -> bool {
        self.queue.push(X::default(), bucket_start)
    }

    /// Materialise the bucket starting at `bucket_start` into the multi-bucket
    /// spans
    pub fn sample(&mut self, bucket_start: Time) {
        if let Some(bucket) = self.queue.get(bucket_start) {
            self.overflow.sample(bucket_start, bucket);
        }
    }

    /// The data of the `bucket_length` long interval containing `time`.
    ///
    /// Single buckets come from the queue, longer lengths from the configured
    /// multi-bucket spans.
    pub fn get(&self, time: Time, bucket_length: Time) -> Option<&X> {
        if bucket_length == self.queue.bucket_length() {
            self.queue.get(time)
        } else {
            self.overflow.get(bucket_length, time)
        }
    }

    pub fn get_mut(&mut self, time: Time) -> Option<&mut X> {
        self.queue.get_mut(time)
    }

    /// Remove pairs from every retained single bucket. Multi-bucket spans are
    /// left untouched.
    pub fn retain_pairs<F: Fn(PidCid) -> bool>(&mut self, keep: F) {
        for (_, bucket) in self.queue.iter_mut() {
            bucket.retain_pairs(&keep);
        }
    }

    pub fn reset_bucket(&mut self, bucket_start: Time) -> bool {
        match self.queue.get_mut(bucket_start) {
            Some(bucket) => {
                *bucket = X::default();
                true
            }
            None => false,
        }
    }

    /// Drop the contents of every bucket and span ending at or before
    /// `cutoff`, returning how many non-empty ones were dropped.
    pub fn release_memory(&mut self, cutoff: Time) -> usize {
        let bucket_length = self.queue.bucket_length();
        let mut released = 0;
        for (start, bucket) in self.queue.iter_mut() {
            if bucket_end(start, bucket_length) <= cutoff && !bucket.is_empty() {
                *bucket = X::default();
                released += 1;
            }
        }
        released + self.overflow.release_memory(cutoff)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflow.clear();
    }

    pub fn reset(&mut self, latest: Time) {
        self.queue.reset(latest);
        self.overflow.clear();
    }

    pub fn accept_persist_inserter<F>(&self, inserter: &mut StateInserter, persist_item: F)
    where
        F: Fn(&X, &mut StateInserter),
    {
        inserter.insert_level(Tag::BucketQueue, |inserter| {
            self.queue.accept_persist_inserter(inserter, &persist_item)
        });
        inserter.insert_level(Tag::MultiBucket, |inserter| {
            self.overflow.accept_persist_inserter(inserter, &persist_item)
        });
    }

    /// Restore from the `BucketQueue` and `MultiBucket` levels written by
    /// [`Self::accept_persist_inserter`]. The persisted spans must match
    /// `spans`.
    pub fn restore<F>(
        queue_level: Option<StateTraverser<'_>>,
        overflow_level: Option<StateTraverser<'_>>,
        latency_buckets: usize,
        bucket_length: Time,
        spans: &[Time],
        mut restore_item: F,
    ) -> Result<Self, PersistError>
    where
        F: FnMut(StateTraverser<'_>) -> Result<X, PersistError>,
    {
        let queue = BucketQueue::restore(
            required(queue_level, Tag::BucketQueue)?,
            latency_buckets,
            bucket_length,
            &mut restore_item,
        )?;
        let overflow = MultiBucketOverflow::restore(
            required(overflow_level, Tag::MultiBucket)?,
            spans,
            &mut restore_item,
        )?;
        Ok(Self { queue, overflow })
    }
}

impl<X: Checksum> Checksum for WindowedBuckets<X> {
    fn checksum(&self) -> u64 {
        checksum::combine(self.queue.checksum(), self.overflow.checksum())
    }
}

impl<X: MemoryUsage> MemoryUsage for WindowedBuckets<X> {
    fn memory_usage(&self) -> usize {
        self.queue.memory_usage() + self.overflow.memory_usage()
    }
}
