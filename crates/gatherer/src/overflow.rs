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

//! Aggregates over spans longer than the bucket length.
//!
//! Each configured span keeps a single entry: the span currently being
//! materialised. Buckets are merged into it as they are sampled, and the entry
//! is replaced once a bucket from a later span arrives. Unlike the
//! [`crate::bucket_queue::BucketQueue`], an entry is never corrected for data
//! arriving late into an already sampled bucket, and a bucket older than the
//! current span start is not merged at all.

use crate::checksum::{self, Checksum};
use crate::error::PersistError;
use crate::memory::MemoryUsage;
use crate::persist::{required, StateInserter, StateTraverser, Tag};
use crate::time::{bucket_end, bucket_start, Time};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Accumulate one bucket's aggregate into another
pub trait Merge {
    fn merge(&mut self, other: &Self);
}

#[derive(Debug, Clone, PartialEq)]
struct SpanEntry<T> {
    start: Time,
    contents: T,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultiBucketOverflow<T> {
    entries: BTreeMap<Time, Option<SpanEntry<T>>>,
}

impl<T> Default for MultiBucketOverflow<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> MultiBucketOverflow<T> {
    pub fn new(spans: &[Time]) -> Self {
        Self {
            entries: spans.iter().map(|span| (*span, None)).collect(),
        }
    }

    /// The configured span lengths in ascending order
    pub fn spans(&self) -> impl Iterator<Item = Time> + '_ {
        self.entries.keys().copied()
    }

    pub fn has_span(&self, span: Time) -> bool {
        self.entries.contains_key(&span)
    }

    /// The aggregate of the `span` long interval containing `time`, if that
    /// interval is the one currently materialised.
    pub fn get(&self, span: Time, time: Time) -> Option<&T> {
        match self.entries.get(&span) {
            Some(Some(entry)) if entry.start == bucket_start(time, span) => Some(&entry.contents),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.entries.values_mut().for_each(|entry| *entry = None);
    }

    /// Drop entries whose span ends at or before `cutoff`, returning how many
    /// were dropped.
    pub fn release_memory(&mut self, cutoff: Time) -> usize {
        let mut released = 0;
        for (span, entry) in self.entries.iter_mut() {
            if matches!(entry, Some(e) if bucket_end(e.start, *span) <= cutoff) {
                *entry = None;
                released += 1;
            }
        }
        released
    }

    pub fn accept_persist_inserter<F>(&self, inserter: &mut StateInserter, persist_contents: F)
    where
        F: Fn(&T, &mut StateInserter),
    {
        for (span, entry) in &self.entries {
            inserter.insert_level(Tag::Span, |inserter| {
                inserter.insert_value(Tag::Span, span);
                if let Some(entry) = entry {
                    inserter.insert_value(Tag::SpanStart, entry.start);
                    inserter.insert_level(Tag::Bucket, |inserter| {
                        persist_contents(&entry.contents, inserter)
                    });
                }
            });
        }
    }
}

impl<T: Default + Merge> MultiBucketOverflow<T> {
    /// Merge the bucket starting at `time` into every span.
    pub fn sample(&mut self, time: Time, bucket: &T) {
        for (span, entry) in self.entries.iter_mut() {
            let start = bucket_start(time, *span);
            match entry {
                Some(current) if current.start == start => current.contents.merge(bucket),
                Some(current) if current.start > start => {
                    debug!(
                        time,
                        span,
                        span_start = current.start,
                        "not merging a bucket older than the current span"
                    );
                }
                _ => {
                    let mut contents = T::default();
                    contents.merge(bucket);
                    *entry = Some(SpanEntry { start, contents });
                }
            }
        }
    }

    /// Restore from the levels written by [`Self::accept_persist_inserter`],
    /// each span's contents are read by `restore_contents`.
    ///
    /// The persisted spans must be exactly the configured `spans`.
    pub fn restore<F>(
        traverser: StateTraverser<'_>,
        spans: &[Time],
        mut restore_contents: F,
    ) -> Result<Self, PersistError>
    where
        F: FnMut(StateTraverser<'_>) -> Result<T, PersistError>,
    {
        let mut result = Self::new(spans);
        let mut restored = BTreeSet::new();
        for entry in traverser {
            let entry = entry?;
            if entry.tag != Tag::Span {
                return Err(PersistError::UnexpectedTag(entry.tag));
            }
            let mut span = None;
            let mut start = None;
            let mut contents = None;
            for field in entry.level()? {
                let field = field?;
                match field.tag {
                    Tag::Span => span = Some(field.parse::<Time>()?),
                    Tag::SpanStart => start = Some(field.parse::<Time>()?),
                    Tag::Bucket => contents = Some(restore_contents(field.level()?)?),
                    other => return Err(PersistError::UnexpectedTag(other)),
                }
            }
            let span = required(span, Tag::Span)?;
            if !result.has_span(span) || !restored.insert(span) {
                return Err(PersistError::InvalidValue {
                    tag: Tag::Span,
                    value: span.to_string(),
                });
            }
            let span_entry = match start {
                Some(start) => Some(SpanEntry {
                    start,
                    contents: required(contents, Tag::Bucket)?,
                }),
                None => None,
            };
            result.entries.insert(span, span_entry);
        }
        if result.spans().any(|span| !restored.contains(&span)) {
            return Err(PersistError::MissingTag(Tag::Span));
        }
        Ok(result)
    }
}

impl<T: Checksum> Checksum for MultiBucketOverflow<T> {
    fn checksum(&self) -> u64 {
        checksum::ordered(
            0,
            self.entries.iter().map(|(span, entry)| {
                let seed = checksum::hash_of(span);
                match entry {
                    Some(entry) => checksum::ordered(
                        seed,
                        [checksum::hash_of(&entry.start), entry.contents.checksum()],
                    ),
                    None => seed,
                }
            }),
        )
    }
}

impl<T: MemoryUsage> MemoryUsage for MultiBucketOverflow<T> {
    fn memory_usage(&self) -> usize {
        self.entries.len() * std::mem::size_of::<(Time, Option<SpanEntry<T>>)>()
            + self
                .entries
                .values()
                .flatten()
                .map(|entry| entry.contents.memory_usage())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Total(u64);

    impl Merge for Total {
        fn merge(&mut self, other: &Self) {
            self.0 += other.0;
        }
    }

    impl Checksum for Total {
        fn checksum(&self) -> u64 {
            checksum::hash_of(&self.0)
        }
    }

    #[test]
    fn test_sample_merges_within_span() {
        let mut overflow = MultiBucketOverflow::new(&[180]);
        overflow.sample(0, &Total(1));
        overflow.sample(60, &Total(2));
        overflow.sample(120, &Total(3));
        assert_eq!(overflow.get(180, 0), Some(&Total(6)));
        assert_eq!(overflow.get(180, 179), Some(&Total(6)));
        overflow.sample(180, &Total(4));
        assert_eq!(overflow.get(180, 0), None);
        assert_eq!(overflow.get(180, 200), Some(&Total(4)));
        assert_eq!(overflow.get(360, 0), None);
    }

    #[test]
    fn test_no_out_of_order_correction() {
        let mut overflow = MultiBucketOverflow::new(&[120]);
        overflow.sample(120, &Total(5));
        // A bucket from the previous span is not merged, and the current span is
        // left as it was.
        overflow.sample(60, &Total(7));
        assert_eq!(overflow.get(120, 120), Some(&Total(5)));
        assert_eq!(overflow.get(120, 60), None);
    }

    #[test]
    fn test_release_memory() {
        let mut overflow = MultiBucketOverflow::new(&[120, 240]);
        overflow.sample(0, &Total(1));
        overflow.sample(60, &Total(1));
        assert_eq!(overflow.release_memory(120), 1);
        assert_eq!(overflow.get(120, 0), None);
        assert_eq!(overflow.get(240, 0), Some(&Total(2)));
        assert_eq!(overflow.release_memory(120), 0);
    }

    #[test]
    fn test_persist_restore() {
        let mut overflow = MultiBucketOverflow::new(&[120, 240]);
        overflow.sample(0, &Total(3));
        overflow.release_memory(120);
        let mut inserter = StateInserter::new();
        overflow.accept_persist_inserter(&mut inserter, |total, inserter| {
            inserter.insert_value(Tag::Value, total.0)
        });
        let stream = inserter.finish();
        let restored =
            MultiBucketOverflow::restore(stream.traverser(), &[120, 240], restore_total).unwrap();
        assert_eq!(restored, overflow);
        assert_eq!(restored.checksum(), overflow.checksum());
    }

    fn restore_total(traverser: StateTraverser<'_>) -> Result<Total, PersistError> {
        let mut total = None;
        for entry in traverser {
            total = Some(Total(entry?.parse()?));
        }
        required(total, Tag::Value)
    }

    #[rstest]
    #[case(&[300], PersistError::InvalidValue { tag: Tag::Span, value: "120".to_string() })]
    #[case(&[120, 240, 300], PersistError::MissingTag(Tag::Span))]
    #[case(&[120], PersistError::InvalidValue { tag: Tag::Span, value: "240".to_string() })]
    fn test_restore_rejects_other_spans(#[case] spans: &[Time], #[case] expected: PersistError) {
        let mut overflow = MultiBucketOverflow::new(&[120, 240]);
        overflow.sample(0, &Total(3));
        let mut inserter = StateInserter::new();
        overflow.accept_persist_inserter(&mut inserter, |total, inserter| {
            inserter.insert_value(Tag::Value, total.0)
        });
        let stream = inserter.finish();
        let err =
            MultiBucketOverflow::restore(stream.traverser(), spans, restore_total).unwrap_err();
        assert_eq!(err.to_string(), expected.to_string());
    }
}
