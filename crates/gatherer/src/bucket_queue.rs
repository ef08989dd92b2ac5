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

//! A fixed capacity circular buffer of per-bucket data indexed by bucket
//! start time.
//!
//! The queue holds the current bucket plus `latency_buckets` trailing buckets.
//! A bucket start `t` lives in slot `(t / bucket_length) mod capacity`, so
//! rolling the window forward never moves data: the slot of the evicted bucket
//! is simply overwritten by the new one.

use crate::checksum::{self, Checksum};
use crate::error::PersistError;
use crate::memory::MemoryUsage;
use crate::persist::{required, StateInserter, StateTraverser, Tag};
use crate::time::{bucket_start, Time};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct BucketQueue<T> {
    items: Vec<T>,
    bucket_length: Time,
    latest_start: Time,
}

impl<T: Default> BucketQueue<T> {
    /// Create a queue retaining `latency_buckets + 1` buckets whose newest
    /// bucket contains `latest`. All slots start out empty.
    pub fn new(latency_buckets: usize, bucket_length: Time, latest: Time) -> Self {
        let items = std::iter::repeat_with(T::default)
            .take(latency_buckets + 1)
            .collect();
        Self {
            items,
            bucket_length,
            latest_start: bucket_start(latest, bucket_length),
        }
    }

    /// Advance the window so that the bucket containing `time` becomes the
    /// newest one, storing `item` for it.
    ///
    /// Buckets skipped over are reset to empty, and everything that falls out
    /// of the window is dropped. Returns false, leaving the queue untouched, if
    /// `time` does not lie after the newest bucket.
    pub fn push(&mut self, item: T, time: Time) -> bool {
        let start = bucket_start(time, self.bucket_length);
        if start <= self.latest_start {
            warn!(
                time,
                latest_start = self.latest_start,
                "refusing to push a bucket that is not newer than the latest bucket"
            );
            return false;
        }
        let skipped = (start - self.latest_start) / self.bucket_length - 1;
        let to_reset = (skipped as usize).min(self.items.len());
        for k in 1..=to_reset as Time {
            let slot = self.slot(self.latest_start + k * self.bucket_length);
            self.items[slot] = T::default();
        }
        let slot = self.slot(start);
        self.items[slot] = item;
        self.latest_start = start;
        true
    }

    /// Reset every retained bucket to empty
    pub fn clear(&mut self) {
        self.items.iter_mut().for_each(|item| *item = T::default());
    }

    /// Reset every bucket and reposition the window at `latest`
    pub fn reset(&mut self, latest: Time) {
        self.clear();
        self.latest_start = bucket_start(latest, self.bucket_length);
    }
}

impl<T> BucketQueue<T> {
    #[inline]
    fn slot(&self, start: Time) -> usize {
        start
            .div_euclid(self.bucket_length)
            .rem_euclid(self.items.len() as Time) as usize
    }

    /// Number of buckets retained, i.e., `latency_buckets + 1`
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn bucket_length(&self) -> Time {
        self.bucket_length
    }

    /// Start of the newest bucket
    pub fn latest_start(&self) -> Time {
        self.latest_start
    }

    /// Start of the oldest retained bucket
    pub fn earliest_start(&self) -> Time {
        self.latest_start - (self.items.len() as Time - 1) * self.bucket_length
    }

    /// Does the bucket containing `time` lie inside the retained window?
    pub fn contains(&self, time: Time) -> bool {
        let start = bucket_start(time, self.bucket_length);
        start >= self.earliest_start() && start <= self.latest_start
    }

    /// Get the data for the bucket containing `time`, or `None` if it is no
    /// longer (or not yet) retained
    pub fn get(&self, time: Time) -> Option<&T> {
        if !self.contains(time) {
            return None;
        }
        let slot = self.slot(bucket_start(time, self.bucket_length));
        self.items.get(slot)
    }

    pub fn get_mut(&mut self, time: Time) -> Option<&mut T> {
        if !self.contains(time) {
            return None;
        }
        let slot = self.slot(bucket_start(time, self.bucket_length));
        self.items.get_mut(slot)
    }

    /// Iterate over `(bucket start, data)` from the oldest to the newest bucket
    pub fn iter(&self) -> impl Iterator<Item = (Time, &T)> {
        let oldest = self.slot(self.earliest_start());
        let (wrapped, head) = self.items.split_at(oldest);
        let earliest = self.earliest_start();
        let bucket_length = self.bucket_length;
        head.iter()
            .chain(wrapped.iter())
            .enumerate()
            .map(move |(k, item)| (earliest + k as Time * bucket_length, item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Time, &mut T)> {
        let oldest = self.slot(self.earliest_start());
        let earliest = self.earliest_start();
        let bucket_length = self.bucket_length;
        let (wrapped, head) = self.items.split_at_mut(oldest);
        head.iter_mut()
            .chain(wrapped.iter_mut())
            .enumerate()
            .map(move |(k, item)| (earliest + k as Time * bucket_length, item))
    }

    /// Write the queue, each bucket's contents are written by `persist_item`
    pub fn accept_persist_inserter<F>(&self, inserter: &mut StateInserter, persist_item: F)
    where
        F: Fn(&T, &mut StateInserter),
    {
        inserter.insert_value(Tag::LatestStart, self.latest_start);
        for (time, item) in self.iter() {
            inserter.insert_level(Tag::Bucket, |inserter| {
                inserter.insert_value(Tag::Time, time);
                persist_item(item, inserter);
            });
        }
    }
}

impl<T: Default> BucketQueue<T> {
    /// Restore a queue written by [`BucketQueue::accept_persist_inserter`].
    ///
    /// Each bucket's contents are read by `restore_item`, which is handed the
    /// nodes that follow the bucket's time.
    pub fn restore<F>(
        traverser: StateTraverser<'_>,
        latency_buckets: usize,
        bucket_length: Time,
        mut restore_item: F,
    ) -> Result<Self, PersistError>
    where
        F: FnMut(StateTraverser<'_>) -> Result<T, PersistError>,
    {
        let mut queue: Option<Self> = None;
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::LatestStart => {
                    queue = Some(Self::new(latency_buckets, bucket_length, entry.parse()?));
                }
                Tag::Bucket => {
                    let queue = queue
                        .as_mut()
                        .ok_or(PersistError::MissingTag(Tag::LatestStart))?;
                    let mut level = entry.level()?;
                    let time_entry = level.next().ok_or(PersistError::MissingTag(Tag::Time))??;
                    if time_entry.tag != Tag::Time {
                        return Err(PersistError::MissingTag(Tag::Time));
                    }
                    let time: Time = time_entry.parse()?;
                    let item = restore_item(level)?;
                    match queue.get_mut(time) {
                        Some(slot) => *slot = item,
                        None => {
                            return Err(PersistError::InvalidValue {
                                tag: Tag::Time,
                                value: time.to_string(),
                            })
                        }
                    }
                }
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        required(queue, Tag::LatestStart)
    }
}

impl<T: Checksum> Checksum for BucketQueue<T> {
    fn checksum(&self) -> u64 {
        checksum::ordered(
            checksum::hash_of(&self.latest_start),
            self.iter()
                .map(|(time, item)| checksum::combine(checksum::hash_of(&time), item.checksum())),
        )
    }
}

impl<T: MemoryUsage> MemoryUsage for BucketQueue<T> {
    fn memory_usage(&self) -> usize {
        self.items.capacity() * std::mem::size_of::<T>()
            + self.items.iter().map(MemoryUsage::memory_usage).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filled(latency: usize) -> BucketQueue<Vec<Time>> {
        let mut queue: BucketQueue<Vec<Time>> = BucketQueue::new(latency, 60, 0);
        queue.get_mut(0).unwrap().push(0);
        for start in (60..=60 * latency as Time).step_by(60) {
            assert!(queue.push(vec![start], start));
        }
        queue
    }

    #[test]
    fn test_get_within_window() {
        let queue = filled(2);
        assert_eq!(queue.latest_start(), 120);
        assert_eq!(queue.earliest_start(), 0);
        assert_eq!(queue.get(0), Some(&vec![0]));
        assert_eq!(queue.get(59), Some(&vec![0]));
        assert_eq!(queue.get(61), Some(&vec![60]));
        assert_eq!(queue.get(179), Some(&vec![120]));
        assert_eq!(queue.get(180), None);
        assert_eq!(queue.get(-1), None);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut queue = filled(2);
        assert!(queue.push(vec![180], 180));
        assert_eq!(queue.get(0), None);
        let contents: Vec<_> = queue.iter().map(|(t, v)| (t, v.clone())).collect();
        assert_eq!(
            contents,
            vec![(60, vec![60]), (120, vec![120]), (180, vec![180])]
        );
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn test_push_skipping_buckets_resets_them(#[case] latency: usize) {
        let mut queue = filled(latency);
        let jump = queue.latest_start() + 5 * 60;
        assert!(queue.push(vec![jump], jump));
        let contents: Vec<_> = queue.iter().map(|(t, v)| (t, v.clone())).collect();
        assert_eq!(contents.len(), latency + 1);
        for (time, item) in &contents[..latency] {
            assert!(item.is_empty(), "bucket {time} should be empty");
        }
        assert_eq!(contents[latency], (jump, vec![jump]));
    }

    #[test]
    fn test_push_not_newer_is_refused() {
        let mut queue = filled(1);
        let before = queue.clone();
        assert!(!queue.push(vec![1], 60));
        assert!(!queue.push(vec![1], 0));
        assert_eq!(queue, before);
    }

    #[test]
    fn test_negative_times() {
        let mut queue: BucketQueue<Vec<Time>> = BucketQueue::new(2, 60, -60);
        queue.get_mut(-61).unwrap().push(-120);
        assert!(queue.push(vec![0], 5));
        assert_eq!(queue.earliest_start(), -120);
        assert_eq!(queue.get(-120), Some(&vec![-120]));
        let times: Vec<_> = queue.iter().map(|(t, _)| t).collect();
        assert_eq!(times, vec![-120, -60, 0]);
    }

    #[test]
    fn test_iter_mut_visits_in_order() {
        let mut queue = filled(3);
        queue.push(vec![], 240);
        for (time, item) in queue.iter_mut() {
            item.push(time * 10);
        }
        let contents: Vec<_> = queue.iter().map(|(t, v)| (t, v.last().copied())).collect();
        assert_eq!(
            contents,
            vec![
                (60, Some(600)),
                (120, Some(1200)),
                (180, Some(1800)),
                (240, Some(2400))
            ]
        );
    }
}
