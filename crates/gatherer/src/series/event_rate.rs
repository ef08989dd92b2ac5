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

use super::{attribute_not_in, count_feature_data, person_not_in, FeatureValues, SeriesHooks};
use crate::aggregates::BucketAggregates;
use crate::checksum::{self, Checksum};
use crate::config::{EntitySeriesKind, Feature, GathererConfig};
use crate::error::PersistError;
use crate::event::EventData;
use crate::interner::StringStore;
use crate::memory::{map_usage, set_usage, MemoryUsage};
use crate::overflow::Merge;
use crate::persist::{required, StateInserter, StateTraverser, Tag};
use crate::registry::{AttributeId, PersonId, PidCid};
use crate::time::Time;
use crate::windowed::{PairData, WindowedBuckets};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// The distinct string values seen for each pair in one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueStrings(FxHashMap<PidCid, FxHashSet<Arc<str>>>);

impl UniqueStrings {
    pub fn insert(&mut self, pid_cid: PidCid, value: Arc<str>) {
        self.0.entry(pid_cid).or_default().insert(value);
    }

    pub fn get(&self, pid_cid: PidCid) -> Option<&FxHashSet<Arc<str>>> {
        self.0.get(&pid_cid)
    }

    /// Number of distinct values over all attributes of each person
    pub fn distinct_by_person(&self) -> Vec<(PersonId, u64)> {
        let mut by_person: FxHashMap<PersonId, FxHashSet<&Arc<str>>> = FxHashMap::default();
        for ((pid, _), values) in &self.0 {
            by_person.entry(*pid).or_default().extend(values.iter());
        }
        let mut result: Vec<_> = by_person
            .into_iter()
            .map(|(pid, values)| (pid, values.len() as u64))
            .collect();
        result.sort_unstable();
        result
    }

    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort_unstable_by_key(|(pid_cid, _)| **pid_cid);
        for ((pid, cid), values) in pairs {
            let mut values: Vec<_> = values.iter().collect();
            values.sort_unstable();
            inserter.insert_level(Tag::Entry, |inserter| {
                inserter.insert_value(Tag::Pid, pid);
                inserter.insert_value(Tag::Cid, cid);
                for value in values {
                    inserter.insert_value(Tag::StringValue, value);
                }
            });
        }
    }

    fn restore(
        traverser: StateTraverser<'_>,
        strings: &mut StringStore,
    ) -> Result<Self, PersistError> {
        let mut result = UniqueStrings::default();
        for entry in traverser {
            let entry = entry?;
            if entry.tag != Tag::Entry {
                return Err(PersistError::UnexpectedTag(entry.tag));
            }
            let mut pid = None;
            let mut cid = None;
            let mut values = FxHashSet::default();
            for field in entry.level()? {
                let field = field?;
                match field.tag {
                    Tag::Pid => pid = Some(field.parse()?),
                    Tag::Cid => cid = Some(field.parse()?),
                    Tag::StringValue => {
                        values.insert(strings.get(field.text()?));
                    }
                    other => return Err(PersistError::UnexpectedTag(other)),
                }
            }
            let pid_cid = (required(pid, Tag::Pid)?, required(cid, Tag::Cid)?);
            result.0.insert(pid_cid, values);
        }
        Ok(result)
    }
}

impl Merge for UniqueStrings {
    fn merge(&mut self, other: &Self) {
        for (pid_cid, values) in &other.0 {
            self.0
                .entry(*pid_cid)
                .or_default()
                .extend(values.iter().cloned());
        }
    }
}

impl PairData for UniqueStrings {
    fn retain_pairs<F: Fn(PidCid) -> bool>(&mut self, keep: F) {
        self.0.retain(|pid_cid, _| keep(*pid_cid));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Checksum for UniqueStrings {
    fn checksum(&self) -> u64 {
        checksum::unordered(
            0,
            self.0.iter().map(|(pid_cid, values)| {
                checksum::unordered(
                    checksum::hash_of(pid_cid),
                    values.iter().map(|value| checksum::hash_of(value.as_ref())),
                )
            }),
        )
    }
}

impl MemoryUsage for UniqueStrings {
    fn memory_usage(&self) -> usize {
        map_usage(&self.0) + self.0.values().map(set_usage).sum::<usize>()
    }
}

/// A series counting the records of each person and attribute
#[derive(Debug, Clone, PartialEq)]
pub struct EventRateSeries {
    unique_strings: WindowedBuckets<UniqueStrings>,
    latency_buckets: usize,
    bucket_length: Time,
}

impl EventRateSeries {
    pub fn new(config: &GathererConfig, latest: Time) -> Self {
        let bucket_length = config.bucket_length_secs();
        Self {
            unique_strings: WindowedBuckets::new(
                config.latency_buckets,
                bucket_length,
                latest,
                &config.multi_bucket_lengths_secs(),
            ),
            latency_buckets: config.latency_buckets,
            bucket_length,
        }
    }

    /// The distinct string values of `pid_cid` in the bucket containing `time`
    pub fn unique_strings(&self, time: Time, pid_cid: PidCid) -> Option<&FxHashSet<Arc<str>>> {
        self.unique_strings
            .get(time, self.bucket_length)
            .and_then(|bucket| bucket.get(pid_cid))
    }

    pub(crate) fn restore(
        config: &GathererConfig,
        traverser: StateTraverser<'_>,
        strings: &mut StringStore,
    ) -> Result<Self, PersistError> {
        let mut series = Self::new(config, 0);
        let mut queue_level = None;
        let mut overflow_level = None;
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::BucketQueue => queue_level = Some(entry.level()?),
                Tag::MultiBucket => overflow_level = Some(entry.level()?),
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        series.unique_strings = WindowedBuckets::restore(
            queue_level,
            overflow_level,
            series.latency_buckets,
            series.bucket_length,
            &config.multi_bucket_lengths_secs(),
            |level| UniqueStrings::restore(level, strings),
        )?;
        Ok(series)
    }
}

impl SeriesHooks for EventRateSeries {
    fn kind(&self) -> EntitySeriesKind {
        EntitySeriesKind::EventRate
    }

    fn add_value(
        &mut self,
        bucket_start: Time,
        pid_cid: PidCid,
        event: &EventData,
        strings: &mut StringStore,
    ) {
        if let Some(value) = event.string_value() {
            if let Some(bucket) = self.unique_strings.get_mut(bucket_start) {
                bucket.insert(pid_cid, strings.get(value));
            }
        }
    }

    fn process_fields(&self, value: Option<&str>, event: &mut EventData) -> bool {
        if let Some(value) = value {
            event.set_string_value(value);
        }
        true
    }

    fn resize(&mut self, _people: usize, _attributes: usize) {}

    fn start_new_bucket(&mut self, bucket_start: Time, _skip_updates: bool) {
        self.unique_strings.start_new_bucket(bucket_start);
    }

    fn sample(&mut self, bucket_start: Time) {
        self.unique_strings.sample(bucket_start);
    }

    fn feature_data(
        &self,
        feature: Feature,
        time: Time,
        bucket_length: Time,
        aggregates: &BucketAggregates,
    ) -> Option<FeatureValues> {
        match feature {
            Feature::UniqueCountByBucketAndPerson => Some(FeatureValues::PersonCounts(
                self.unique_strings
                    .get(time, bucket_length)
                    .map(UniqueStrings::distinct_by_person)
                    .unwrap_or_default(),
            )),
            _ => count_feature_data(feature, aggregates),
        }
    }

    fn recycle_people(&mut self, pids: &[PersonId]) {
        self.unique_strings.retain_pairs(person_not_in(pids));
    }

    fn remove_people(&mut self, lowest: PersonId) {
        self.unique_strings.retain_pairs(|(pid, _)| pid < lowest);
    }

    fn recycle_attributes(&mut self, cids: &[AttributeId]) {
        self.unique_strings.retain_pairs(attribute_not_in(cids));
    }

    fn remove_attributes(&mut self, lowest: AttributeId) {
        self.unique_strings.retain_pairs(|(_, cid)| cid < lowest);
    }

    fn reset_bucket(&mut self, bucket_start: Time) {
        self.unique_strings.reset_bucket(bucket_start);
    }

    fn release_memory(&mut self, cutoff: Time) -> usize {
        self.unique_strings.release_memory(cutoff)
    }

    fn clear(&mut self) {
        self.unique_strings.clear();
    }

    fn reset_window(&mut self, latest: Time) {
        self.unique_strings.reset(latest);
    }

    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        self.unique_strings
            .accept_persist_inserter(inserter, |bucket, inserter| {
                bucket.accept_persist_inserter(inserter)
            });
    }
}

impl Checksum for EventRateSeries {
    fn checksum(&self) -> u64 {
        self.unique_strings.checksum()
    }
}

impl MemoryUsage for EventRateSeries {
    fn memory_usage(&self) -> usize {
        self.unique_strings.memory_usage()
    }
}
