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

//! The bucket gatherer: rolls records into fixed-length buckets.
//!
//! A [`BucketGatherer`] owns the retained buckets of one data series. Time
//! only moves forward: each record, or an explicit call to
//! [`BucketGatherer::time_now`] or [`BucketGatherer::sample_now`], may open
//! new buckets. Records may arrive late, up to `latency_buckets` buckets
//! before the current one. Anything earlier is rejected and leaves the state
//! untouched.
//!
//! Generic aggregates (pair counts, explicit nulls, influencer counts) are
//! kept here, the rest is delegated to the [`EntitySeries`] of the gatherer's
//! kind.

use crate::aggregates::{BucketAggregates, InfluenceKey};
use crate::checksum::{self, Checksum};
use crate::config::{ConfigurationError, EntitySeriesKind, Feature, GathererConfig};
use crate::error::{GathererError, PersistError};
use crate::event::EventData;
use crate::interner::StringStore;
use crate::memory::MemoryUsage;
use crate::persist::{required, StateInserter, StateTraverser, Tag, TaggedStream};
use crate::registry::{AttributeId, EntityRegistry, EntityStatus, PersonId, PidCid};
use crate::series::{
    attribute_not_in, kind_tag, person_not_in, EntitySeries, FeatureValues, SeriesHooks,
};
use crate::time::{bucket_start, display_time, Time};
use crate::windowed::WindowedBuckets;
use std::fmt::Write;
use tracing::{debug, trace, warn};


#[derive(Debug, Clone)]
pub struct BucketGatherer {
    config: GathererConfig,
    features: Vec<Feature>,
    bucket_length: Time,
    latency_buckets: usize,
    current_bucket_start: Time,
    earliest_time: Option<Time>,
    aggregates: WindowedBuckets<BucketAggregates>,
    series: EntitySeries,
    strings: StringStore,
    people: usize,
    attributes: usize,
}

impl BucketGatherer {
    /// Create a gatherer whose current bucket contains `start_time`
    pub fn new(
        kind: EntitySeriesKind,
        config: GathererConfig,
        start_time: Time,
    ) -> Result<Self, ConfigurationError> {
        config.validate(kind)?;
        let bucket_length = config.bucket_length_secs();
        let latency_buckets = config.latency_buckets;
        Ok(Self {
            features: config.features_for(kind),
            bucket_length,
            latency_buckets,
            current_bucket_start: bucket_start(start_time, bucket_length),
            earliest_time: None,
            aggregates: WindowedBuckets::new(
                latency_buckets,
                bucket_length,
                start_time,
                &config.multi_bucket_lengths_secs(),
            ),
            series: EntitySeries::new(kind, &config, start_time),
            strings: StringStore::new(),
            people: 0,
            attributes: 0,
            config,
        })
    }

    pub fn kind(&self) -> EntitySeriesKind {
        self.series.kind()
    }

    pub fn config(&self) -> &GathererConfig {
        &self.config
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn series(&self) -> &EntitySeries {
        &self.series
    }

    pub fn bucket_length(&self) -> Time {
        self.bucket_length
    }

    pub fn latency_buckets(&self) -> usize {
        self.latency_buckets
    }

    pub fn current_bucket_start_time(&self) -> Time {
        self.current_bucket_start
    }

    /// Drop every retained bucket and make the bucket containing `time` the
    /// current one
    pub fn set_current_bucket_start_time(&mut self, time: Time) {
        let start = bucket_start(time, self.bucket_length);
        self.aggregates.reset(start);
        self.series.reset_window(start);
        self.current_bucket_start = start;
    }

    /// Start of the oldest bucket still accepting records
    pub fn earliest_bucket_start_time(&self) -> Time {
        self.current_bucket_start - self.latency_buckets as Time * self.bucket_length
    }

    /// The earliest time of any accepted record, if any
    pub fn earliest_time(&self) -> Option<Time> {
        self.earliest_time
    }

    /// Advance time to `time`, opening any buckets up to the one containing
    /// it. Returns false, without changing anything, if `time` is earlier than
    /// the oldest bucket still accepting records.
    pub fn time_now(&mut self, time: Time) -> bool {
        if time < self.earliest_bucket_start_time() {
            debug!(
                time = %display_time(time),
                earliest_bucket_start = %display_time(self.earliest_bucket_start_time()),
                "time is earlier than the latency window"
            );
            return false;
        }
        self.hidden_time_now(time, false);
        true
    }

    /// Advance time so that the bucket starting at `sample_bucket_start` has
    /// left the latency window, then materialise it into the multi-bucket
    /// spans.
    pub fn sample_now(&mut self, sample_bucket_start: Time) {
        let time = self.sample_time(sample_bucket_start);
        self.hidden_time_now(time, false);
        self.sample(sample_bucket_start);
    }

    /// Advance time like [`Self::sample_now`], but without any update that
    /// would affect the models and without sampling.
    pub fn skip_sample_now(&mut self, sample_bucket_start: Time) {
        let time = self.sample_time(sample_bucket_start);
        self.hidden_time_now(time, true);
    }

    fn sample_time(&self, sample_bucket_start: Time) -> Time {
        bucket_start(sample_bucket_start, self.bucket_length)
            + (self.latency_buckets as Time + 1) * self.bucket_length
            - 1
    }

    fn hidden_time_now(&mut self, time: Time, skip_updates: bool) {
        let new_start = bucket_start(time, self.bucket_length);
        let steps = (new_start - self.current_bucket_start) / self.bucket_length;
        if steps <= 0 {
            return;
        }
        // Past a full window, the buckets opened in between are all empty
        let capacity = self.latency_buckets as Time + 1;
        for k in 1..=steps.min(capacity) {
            self.start_new_bucket(self.current_bucket_start + k * self.bucket_length, skip_updates);
        }
        if steps > capacity {
            self.start_new_bucket(new_start, skip_updates);
        }
        self.current_bucket_start = new_start;
    }

    fn start_new_bucket(&mut self, start: Time, skip_updates: bool) {
        trace!(bucket_start = start, skip_updates, "starting new bucket");
        self.series.start_new_bucket(start, skip_updates);
        self.aggregates.start_new_bucket(start);
    }

    /// Materialise the bucket containing `time` into the multi-bucket spans
    fn sample(&mut self, time: Time) {
        let start = bucket_start(time, self.bucket_length);
        self.aggregates.sample(start);
        self.series.sample(start);
    }

    /// Has any record been seen at or before the bucket containing `time`?
    pub fn data_available(&self, time: Time) -> bool {
        self.earliest_time
            .is_some_and(|earliest| time >= bucket_start(earliest, self.bucket_length))
    }

    /// The first bucket in `[start, end)` which is retained and for which data
    /// is available, `end` if there is none
    pub fn validate_sample_times(&self, start: Time, end: Time) -> Time {
        let mut time = bucket_start(start, self.bucket_length);
        if time < start {
            time += self.bucket_length;
        }
        while time < end {
            if self.data_available(time) && self.aggregates.queue().contains(time) {
                return time;
            }
            time += self.bucket_length;
        }
        end
    }

    /// Add a record.
    ///
    /// Returns `Ok(false)` if the record is too late, `Ok(true)` if it was
    /// accepted. Records that carry no person, attribute or non-zero count,
    /// records of recycled entities and records with non-finite values are
    /// accepted but ignored.
    pub fn add_event_data<R: EntityRegistry>(
        &mut self,
        event: &EventData,
        registry: &R,
    ) -> Result<bool, GathererError> {
        let time = event.time().ok_or(GathererError::MissingTime)?;
        if time < self.earliest_bucket_start_time() {
            debug!(
                time = %display_time(time),
                earliest_bucket_start = %display_time(self.earliest_bucket_start_time()),
                "dropping record that is earlier than the latency window"
            );
            return Ok(false);
        }
        let (pid, cid) = match (event.person_id(), event.attribute_id()) {
            (Some(pid), Some(cid)) => (pid, cid),
            _ => {
                self.observe(time);
                return Ok(true);
            }
        };
        match registry.person_status(pid) {
            EntityStatus::Unknown => return Err(GathererError::UnknownPerson(pid)),
            EntityStatus::Recycled => {
                debug!(pid, "ignoring record of recycled person");
                return Ok(true);
            }
            EntityStatus::Active => {}
        }
        match registry.attribute_status(cid) {
            EntityStatus::Unknown => return Err(GathererError::UnknownAttribute(cid)),
            EntityStatus::Recycled => {
                debug!(cid, "ignoring record of recycled attribute");
                return Ok(true);
            }
            EntityStatus::Active => {}
        }
        if event.values().iter().any(|x| !x.is_finite()) {
            debug!(pid, cid, "ignoring record with non-finite values");
            return Ok(true);
        }
        self.resize(pid, cid)?;
        self.observe(time);

        let count = match event.count() {
            Some(count) if count > 0 => count,
            _ => return Ok(true),
        };
        let start = bucket_start(time, self.bucket_length);
        let Some(bucket) = self.aggregates.get_mut(start) else {
            return Ok(true);
        };
        if event.is_explicit_null() {
            bucket.mark_explicit_null((pid, cid));
            return Ok(true);
        }
        bucket.add_count((pid, cid), count);
        let influences: Vec<_> = event
            .influences()
            .iter()
            .map(|influence| influence.as_ref().map(|x| self.strings.canonical(x)))
            .collect();
        bucket.add_influences((pid, cid), &influences, count);
        self.series
            .add_value(start, (pid, cid), event, &mut self.strings);
        Ok(true)
    }

    /// Fill in `event` from the raw value field of a record, as this gatherer's
    /// series interprets it. Returns false if the record is unusable.
    pub fn process_fields(&self, value: Option<&str>, event: &mut EventData) -> bool {
        self.series.process_fields(value, event)
    }

    /// Note an accepted record at `time`
    fn observe(&mut self, time: Time) {
        self.earliest_time = Some(self.earliest_time.map_or(time, |e| e.min(time)));
        self.hidden_time_now(time, false);
    }

    /// Make room for `pid` and `cid`
    fn resize(&mut self, pid: PersonId, cid: AttributeId) -> Result<(), GathererError> {
        if let Some(limit) = self.config.max_people {
            if pid >= limit {
                return Err(GathererError::CapacityExhausted {
                    what: "people",
                    requested: pid,
                    limit,
                });
            }
        }
        if let Some(limit) = self.config.max_attributes {
            if cid >= limit {
                return Err(GathererError::CapacityExhausted {
                    what: "attributes",
                    requested: cid,
                    limit,
                });
            }
        }
        if pid >= self.people || cid >= self.attributes {
            self.people = self.people.max(pid + 1);
            self.attributes = self.attributes.max(cid + 1);
            self.series.resize(self.people, self.attributes);
        }
        Ok(())
    }

    /// Non-zero counts of every pair in the bucket containing `time`, sorted
    pub fn bucket_counts(&self, time: Time) -> Vec<(PidCid, u64)> {
        let mut counts: Vec<_> = self
            .bucket(time)
            .map(|bucket| bucket.counts().iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default();
        counts.sort_unstable();
        counts
    }

    /// Influencer counts of the bucket containing `time`, one sorted vector
    /// per influencing field
    pub fn influencer_counts(&self, time: Time) -> Vec<Vec<(InfluenceKey, u64)>> {
        self.bucket(time)
            .map(|bucket| {
                bucket
                    .influencers()
                    .iter()
                    .map(|field| {
                        let mut counts: Vec<_> =
                            field.iter().map(|(k, v)| (k.clone(), *v)).collect();
                        counts.sort_unstable();
                        counts
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Counts summed over attributes in the bucket containing `time`, sorted
    /// by person
    pub fn person_non_zero_counts(&self, time: Time) -> Vec<(PersonId, u64)> {
        self.bucket(time)
            .map(BucketAggregates::person_non_zero_counts)
            .unwrap_or_default()
    }

    pub fn has_explicit_nulls_only(&self, time: Time, pid: PersonId, cid: AttributeId) -> bool {
        self.bucket(time)
            .is_some_and(|bucket| bucket.has_explicit_nulls_only((pid, cid)))
    }

    /// The configured features of the `bucket_length` long interval
    /// containing `time`.
    ///
    /// `bucket_length` is either the gatherer's bucket length or one of the
    /// configured multi-bucket lengths, for which only the span currently
    /// being materialised is available. Anything else yields no features.
    pub fn feature_data(&self, time: Time, bucket_length: Time) -> Vec<(Feature, FeatureValues)> {
        let Some(aggregates) = self.aggregates.get(time, bucket_length) else {
            return Vec::new();
        };
        self.features
            .iter()
            .filter_map(|feature| {
                self.series
                    .feature_data(*feature, time, bucket_length, aggregates)
                    .map(|values| (*feature, values))
            })
            .collect()
    }

    fn bucket(&self, time: Time) -> Option<&BucketAggregates> {
        self.aggregates.get(time, self.bucket_length)
    }

    /// Remove the data of the recycled people `pids`, which must be sorted,
    /// from every retained bucket
    pub fn recycle_people(&mut self, pids: &[PersonId]) {
        self.aggregates.retain_pairs(person_not_in(pids));
        self.series.recycle_people(pids);
    }

    /// Remove the data of every person from `lowest` onwards
    pub fn remove_people(&mut self, lowest: PersonId) {
        self.aggregates.retain_pairs(|(pid, _)| pid < lowest);
        self.series.remove_people(lowest);
        self.people = self.people.min(lowest);
    }

    /// Remove the data of the recycled attributes `cids`, which must be
    /// sorted, from every retained bucket
    pub fn recycle_attributes(&mut self, cids: &[AttributeId]) {
        self.aggregates.retain_pairs(attribute_not_in(cids));
        self.series.recycle_attributes(cids);
    }

    /// Remove the data of every attribute from `lowest` onwards
    pub fn remove_attributes(&mut self, lowest: AttributeId) {
        self.aggregates.retain_pairs(|(_, cid)| cid < lowest);
        self.series.remove_attributes(lowest);
        self.attributes = self.attributes.min(lowest);
    }

    /// Drop all data of buckets and spans ending at or before `cutoff`,
    /// returning the number of buckets and spans dropped
    pub fn release_memory(&mut self, cutoff: Time) -> usize {
        let before = self.memory_usage();
        let released = self.aggregates.release_memory(cutoff) + self.series.release_memory(cutoff);
        let strings = self.strings.prune();
        debug!(
            cutoff = %display_time(cutoff),
            released,
            strings,
            freed = before.saturating_sub(self.memory_usage()),
            "released memory"
        );
        released
    }

    /// Clear the bucket starting at `bucket_start` so that it can be gathered
    /// again. Returns false if the bucket is not retained.
    pub fn reset_bucket(&mut self, bucket_start: Time) -> bool {
        if !self.aggregates.reset_bucket(bucket_start) {
            warn!(
                bucket_start = %display_time(bucket_start),
                earliest_bucket_start = %display_time(self.earliest_bucket_start_time()),
                current_bucket_start = %display_time(self.current_bucket_start),
                "cannot reset a bucket outside of the latency window"
            );
            return false;
        }
        self.series.reset_bucket(bucket_start);
        true
    }

    /// Drop every retained bucket and span, keeping the current time
    pub fn clear(&mut self) {
        self.aggregates.clear();
        self.series.clear();
        self.strings.prune();
    }

    /// A human readable dump of the current bucket
    pub fn print_current_bucket(&self) -> String {
        let mut result = format!("bucket {}\n", display_time(self.current_bucket_start));
        for ((pid, cid), count) in self.bucket_counts(self.current_bucket_start) {
            let _ = writeln!(result, "person {pid} attribute {cid}: {count}");
        }
        if let Some(bucket) = self.bucket(self.current_bucket_start) {
            let mut nulls: Vec<_> = bucket.explicit_nulls().iter().copied().collect();
            nulls.sort_unstable();
            for (pid, cid) in nulls {
                let _ = writeln!(result, "person {pid} attribute {cid}: explicit null");
            }
        }
        for (field, counts) in self
            .influencer_counts(self.current_bucket_start)
            .iter()
            .enumerate()
        {
            for (((pid, cid), influence), count) in counts {
                let _ = writeln!(
                    result,
                    "influencer {field} person {pid} attribute {cid} {influence}: {count}"
                );
            }
        }
        result
    }

    /// A copy which can only be persisted, to write state off the ingest path
    pub fn clone_for_snapshot(&self) -> GathererSnapshot {
        GathererSnapshot {
            state: self.state().cloned(),
        }
    }

    fn state(&self) -> PersistedState<&WindowedBuckets<BucketAggregates>, &EntitySeries> {
        PersistedState {
            bucket_length: self.bucket_length,
            current_bucket_start: self.current_bucket_start,
            earliest_time: self.earliest_time,
            aggregates: &self.aggregates,
            series: &self.series,
        }
    }

    pub fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        self.state().accept_persist_inserter(inserter)
    }

    pub fn persist(&self) -> TaggedStream {
        let mut inserter = StateInserter::new();
        self.accept_persist_inserter(&mut inserter);
        inserter.finish()
    }

    /// Restore a gatherer of `kind` with `config` from `stream`.
    ///
    /// The whole restore fails on the first unexpected or malformed entry.
    pub fn restore(
        kind: EntitySeriesKind,
        config: GathererConfig,
        stream: &TaggedStream,
    ) -> Result<Self, PersistError> {
        let mut gatherer = Self::new(kind, config, 0)?;
        let expected = kind_tag(kind);
        let mut traverser = stream.traverser();
        let entry = required(traverser.next(), expected)??;
        if entry.tag != expected {
            return Err(PersistError::KindMismatch {
                expected,
                found: entry.tag,
            });
        }
        if let Some(extra) = traverser.next() {
            return Err(PersistError::UnexpectedTag(extra?.tag));
        }
        gatherer.restore_state(entry.level()?)?;
        Ok(gatherer)
    }

    fn restore_state(&mut self, traverser: StateTraverser<'_>) -> Result<(), PersistError> {
        let mut current_bucket_start = None;
        let mut queue_level = None;
        let mut overflow_level = None;
        let mut series_level = None;
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::BucketLength => {
                    let bucket_length: Time = entry.parse()?;
                    if bucket_length != self.bucket_length {
                        return Err(PersistError::InvalidValue {
                            tag: Tag::BucketLength,
                            value: bucket_length.to_string(),
                        });
                    }
                }
                Tag::BucketStart => current_bucket_start = Some(entry.parse()?),
                Tag::EarliestTime => self.earliest_time = Some(entry.parse()?),
                Tag::BucketQueue => queue_level = Some(entry.level()?),
                Tag::MultiBucket => overflow_level = Some(entry.level()?),
                Tag::Series => series_level = Some(entry.level()?),
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        self.current_bucket_start = required(current_bucket_start, Tag::BucketStart)?;
        let strings = &mut self.strings;
        self.aggregates = WindowedBuckets::restore(
            queue_level,
            overflow_level,
            self.latency_buckets,
            self.bucket_length,
            &self.config.multi_bucket_lengths_secs(),
            |level| BucketAggregates::restore(level, strings),
        )?;
        self.series = EntitySeries::restore(
            self.series.kind(),
            &self.config,
            required(series_level, Tag::Series)?,
            &mut self.strings,
        )?;
        self.people = 0;
        self.attributes = 0;
        for (_, bucket) in self.aggregates.queue().iter() {
            for (pid, cid) in bucket.counts().keys() {
                self.people = self.people.max(pid + 1);
                self.attributes = self.attributes.max(cid + 1);
            }
        }
        self.series.resize(self.people, self.attributes);
        Ok(())
    }
}

impl Checksum for BucketGatherer {
    fn checksum(&self) -> u64 {
        self.state().checksum()
    }
}

impl MemoryUsage for BucketGatherer {
    fn memory_usage(&self) -> usize {
        self.aggregates.memory_usage() + self.series.memory_usage() + self.strings.memory_usage()
    }
}

/// The state written by [`BucketGatherer::persist`], shared by the gatherer
/// and its snapshots
#[derive(Debug, Clone)]
struct PersistedState<A, S> {
    bucket_length: Time,
    current_bucket_start: Time,
    earliest_time: Option<Time>,
    aggregates: A,
    series: S,
}

impl PersistedState<&WindowedBuckets<BucketAggregates>, &EntitySeries> {
    fn cloned(&self) -> PersistedState<WindowedBuckets<BucketAggregates>, EntitySeries> {
        PersistedState {
            bucket_length: self.bucket_length,
            current_bucket_start: self.current_bucket_start,
            earliest_time: self.earliest_time,
            aggregates: self.aggregates.clone(),
            series: self.series.clone(),
        }
    }
}

impl<A, S> PersistedState<A, S>
where
    A: std::borrow::Borrow<WindowedBuckets<BucketAggregates>>,
    S: std::borrow::Borrow<EntitySeries>,
{
    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        let series = self.series.borrow();
        inserter.insert_level(series.persistence_tag(), |inserter| {
            inserter.insert_value(Tag::BucketLength, self.bucket_length);
            inserter.insert_value(Tag::BucketStart, self.current_bucket_start);
            if let Some(earliest_time) = self.earliest_time {
                inserter.insert_value(Tag::EarliestTime, earliest_time);
            }
            self.aggregates
                .borrow()
                .accept_persist_inserter(inserter, |bucket, inserter| {
                    bucket.accept_persist_inserter(inserter)
                });
            inserter.insert_level(Tag::Series, |inserter| {
                series.accept_persist_inserter(inserter)
            });
        });
    }

    fn checksum(&self) -> u64 {
        checksum::ordered(
            checksum::hash_of(&self.bucket_length),
            [
                checksum::hash_of(&self.current_bucket_start),
                checksum::hash_of(&self.earliest_time),
                self.aggregates.borrow().checksum(),
                self.series.borrow().checksum(),
            ],
        )
    }
}

/// A copy of a gatherer's retained state made by
/// [`BucketGatherer::clone_for_snapshot`].
///
/// It persists identically to the gatherer it was taken from, but cannot
/// gather: it has no string store and no entity bookkeeping, so it can be
/// moved to another thread and written there.
#[derive(Debug, Clone)]
pub struct GathererSnapshot {
    state: PersistedState<WindowedBuckets<BucketAggregates>, EntitySeries>,
}

impl GathererSnapshot {
    pub fn kind(&self) -> EntitySeriesKind {
        self.state.series.kind()
    }

    pub fn current_bucket_start_time(&self) -> Time {
        self.state.current_bucket_start
    }

    pub fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        self.state.accept_persist_inserter(inserter)
    }

    pub fn persist(&self) -> TaggedStream {
        let mut inserter = StateInserter::new();
        self.accept_persist_inserter(&mut inserter);
        inserter.finish()
    }
}

impl Checksum for GathererSnapshot {
    fn checksum(&self) -> u64 {
        self.state.checksum()
    }
}
