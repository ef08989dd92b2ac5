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

use super::{attribute_not_in, person_not_in, FeatureValues, MetricValue, SeriesHooks};
use crate::aggregates::BucketAggregates;
use crate::checksum::{self, Checksum};
use crate::config::{EntitySeriesKind, Feature, GathererConfig};
use crate::error::PersistError;
use crate::event::EventData;
use crate::interner::StringStore;
use crate::memory::{map_usage, MemoryUsage};
use crate::overflow::Merge;
use crate::persist::{join_f64, required, StateInserter, StateTraverser, Tag};
use crate::registry::{AttributeId, PersonId, PidCid};
use crate::time::Time;
use crate::windowed::{PairData, WindowedBuckets};
use rustc_hash::FxHashMap;
use tracing::trace;

#[inline]
fn aggr_add(lhs: &mut Vec<f64>, rhs: &[f64]) {
    lhs.iter_mut().zip(rhs.iter()).for_each(|(a, b)| *a += *b);
    // If the other value is longer, just append to the vector
    if rhs.len() > lhs.len() {
        lhs.extend_from_slice(&rhs[lhs.len()..]);
    }
}

#[inline]
fn aggr_min(lhs: &mut Vec<f64>, rhs: &[f64]) {
    lhs.iter_mut().zip(rhs.iter()).for_each(|(a, b)| *a = a.min(*b));
    if rhs.len() > lhs.len() {
        lhs.extend_from_slice(&rhs[lhs.len()..]);
    }
}

#[inline]
fn aggr_max(lhs: &mut Vec<f64>, rhs: &[f64]) {
    lhs.iter_mut().zip(rhs.iter()).for_each(|(a, b)| *a = a.max(*b));
    if rhs.len() > lhs.len() {
        lhs.extend_from_slice(&rhs[lhs.len()..]);
    }
}

/// Summary statistics of the measurements of one pair, element-wise over
/// the dimensions of the measured values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricStats {
    count: u64,
    sum: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl MetricStats {
    pub fn add(&mut self, values: &[f64]) {
        if values.is_empty() {
            return;
        }
        self.count += 1;
        aggr_add(&mut self.sum, values);
        aggr_min(&mut self.min, values);
        aggr_max(&mut self.max, values);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> &[f64] {
        &self.sum
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    pub fn mean(&self) -> Vec<f64> {
        if self.count == 0 {
            return Vec::new();
        }
        let n = self.count as f64;
        self.sum.iter().map(|x| x / n).collect()
    }

    fn merge(&mut self, other: &MetricStats) {
        self.count += other.count;
        aggr_add(&mut self.sum, &other.sum);
        aggr_min(&mut self.min, &other.min);
        aggr_max(&mut self.max, &other.max);
    }

    fn checksum(&self) -> u64 {
        checksum::ordered(
            checksum::hash_of(&self.count),
            self.sum
                .iter()
                .chain(self.min.iter())
                .chain(self.max.iter())
                .map(|x| checksum::hash_f64(*x)),
        )
    }
}

/// The statistics of every pair in one bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBucket(FxHashMap<PidCid, MetricStats>);

impl MetricBucket {
    pub fn get(&self, pid_cid: PidCid) -> Option<&MetricStats> {
        self.0.get(&pid_cid)
    }

    /// Measurement counts summed over the attributes of each person
    fn counts_by_person(&self) -> FxHashMap<PersonId, u64> {
        let mut result = FxHashMap::default();
        for ((pid, _), stats) in &self.0 {
            *result.entry(*pid).or_insert(0) += stats.count;
        }
        result
    }

    fn values<F: Fn(&MetricStats) -> Vec<f64>>(&self, value: F) -> Vec<(PidCid, MetricValue)> {
        let mut result: Vec<_> = self
            .0
            .iter()
            .filter(|(_, stats)| stats.count > 0)
            .map(|(pid_cid, stats)| {
                (
                    *pid_cid,
                    MetricValue {
                        value: value(stats),
                        count: stats.count,
                    },
                )
            })
            .collect();
        result.sort_unstable_by_key(|(pid_cid, _)| *pid_cid);
        result
    }

    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        let mut pairs: Vec<_> = self.0.iter().collect();
        pairs.sort_unstable_by_key(|(pid_cid, _)| **pid_cid);
        for ((pid, cid), stats) in pairs {
            inserter.insert_level(Tag::Entry, |inserter| {
                inserter.insert_value(Tag::Pid, pid);
                inserter.insert_value(Tag::Cid, cid);
                inserter.insert_value(Tag::MeasurementCount, stats.count);
                inserter.insert_value(Tag::Sum, join_f64(&stats.sum));
                inserter.insert_value(Tag::Min, join_f64(&stats.min));
                inserter.insert_value(Tag::Max, join_f64(&stats.max));
            });
        }
    }

    fn restore(traverser: StateTraverser<'_>) -> Result<Self, PersistError> {
        let mut result = MetricBucket::default();
        for entry in traverser {
            let entry = entry?;
            if entry.tag != Tag::Entry {
                return Err(PersistError::UnexpectedTag(entry.tag));
            }
            let mut pid = None;
            let mut cid = None;
            let mut stats = MetricStats::default();
            for field in entry.level()? {
                let field = field?;
                match field.tag {
                    Tag::Pid => pid = Some(field.parse()?),
                    Tag::Cid => cid = Some(field.parse()?),
                    Tag::MeasurementCount => stats.count = field.parse()?,
                    Tag::Sum => stats.sum = field.parse_f64s()?,
                    Tag::Min => stats.min = field.parse_f64s()?,
                    Tag::Max => stats.max = field.parse_f64s()?,
                    other => return Err(PersistError::UnexpectedTag(other)),
                }
            }
            let pid_cid = (required(pid, Tag::Pid)?, required(cid, Tag::Cid)?);
            result.0.insert(pid_cid, stats);
        }
        Ok(result)
    }
}

impl Merge for MetricBucket {
    fn merge(&mut self, other: &Self) {
        for (pid_cid, stats) in &other.0 {
            self.0.entry(*pid_cid).or_default().merge(stats);
        }
    }
}

impl PairData for MetricBucket {
    fn retain_pairs<F: Fn(PidCid) -> bool>(&mut self, keep: F) {
        self.0.retain(|pid_cid, _| keep(*pid_cid));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Checksum for MetricBucket {
    fn checksum(&self) -> u64 {
        checksum::unordered(
            0,
            self.0.iter().map(|(pid_cid, stats)| {
                checksum::combine(checksum::hash_of(pid_cid), stats.checksum())
            }),
        )
    }
}

impl MemoryUsage for MetricBucket {
    fn memory_usage(&self) -> usize {
        map_usage(&self.0)
            + self
                .0
                .values()
                .map(|stats| {
                    (stats.sum.capacity() + stats.min.capacity() + stats.max.capacity())
                        * std::mem::size_of::<f64>()
                })
                .sum::<usize>()
    }
}

/// A series summarising the values measured for each person and attribute.
///
/// Besides the bucket statistics it keeps, per person, a smoothed count of
/// measurements per bucket. It is updated from each bucket as it leaves the
/// latency window, so only from buckets which can no longer change.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    stats: WindowedBuckets<MetricBucket>,
    effective_sample_counts: Vec<f64>,
    sample_count_weight: f64,
    latency_buckets: usize,
    bucket_length: Time,
}

impl MetricSeries {
    pub fn new(config: &GathererConfig, latest: Time) -> Self {
        let bucket_length = config.bucket_length_secs();
        Self {
            stats: WindowedBuckets::new(
                config.latency_buckets,
                bucket_length,
                latest,
                &config.multi_bucket_lengths_secs(),
            ),
            effective_sample_counts: Vec::new(),
            sample_count_weight: config.sample_count_weight,
            latency_buckets: config.latency_buckets,
            bucket_length,
        }
    }

    /// The statistics of `pid_cid` in the bucket containing `time`
    pub fn stats(&self, time: Time, pid_cid: PidCid) -> Option<&MetricStats> {
        self.stats
            .get(time, self.bucket_length)
            .and_then(|bucket| bucket.get(pid_cid))
    }

    /// The smoothed number of measurements per bucket of `pid`, zero until a
    /// bucket with measurements of `pid` has left the latency window
    pub fn effective_sample_count(&self, pid: PersonId) -> f64 {
        self.effective_sample_counts
            .get(pid)
            .copied()
            .unwrap_or(0.0)
    }

    fn update_sample_counts(&mut self, bucket_start: Time) {
        let counts = match self.stats.queue().get(bucket_start) {
            Some(bucket) => bucket.counts_by_person(),
            None => return,
        };
        for (pid, count) in counts {
            if count == 0 {
                continue;
            }
            if self.effective_sample_counts.len() <= pid {
                self.effective_sample_counts.resize(pid + 1, 0.0);
            }
            let current = &mut self.effective_sample_counts[pid];
            if *current == 0.0 {
                *current = count as f64;
            } else {
                *current += self.sample_count_weight * (count as f64 - *current);
            }
        }
    }

    pub(crate) fn restore(
        config: &GathererConfig,
        traverser: StateTraverser<'_>,
    ) -> Result<Self, PersistError> {
        let mut series = Self::new(config, 0);
        let mut queue_level = None;
        let mut overflow_level = None;
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::BucketQueue => queue_level = Some(entry.level()?),
                Tag::MultiBucket => overflow_level = Some(entry.level()?),
                Tag::SampleCounts => series.restore_sample_counts(entry.level()?)?,
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        series.stats = WindowedBuckets::restore(
            queue_level,
            overflow_level,
            series.latency_buckets,
            series.bucket_length,
            &config.multi_bucket_lengths_secs(),
            MetricBucket::restore,
        )?;
        Ok(series)
    }

    fn restore_sample_counts(
        &mut self,
        traverser: StateTraverser<'_>,
    ) -> Result<(), PersistError> {
        for person in traverser {
            let mut pid: Option<PersonId> = None;
            let mut count: Option<f64> = None;
            for field in person?.level()? {
                let field = field?;
                match field.tag {
                    Tag::Pid => pid = Some(field.parse()?),
                    Tag::Value => count = Some(field.parse()?),
                    other => return Err(PersistError::UnexpectedTag(other)),
                }
            }
            let pid = required(pid, Tag::Pid)?;
            if self.effective_sample_counts.len() <= pid {
                self.effective_sample_counts.resize(pid + 1, 0.0);
            }
            self.effective_sample_counts[pid] = required(count, Tag::Value)?;
        }
        Ok(())
    }
}

impl SeriesHooks for MetricSeries {
    fn kind(&self) -> EntitySeriesKind {
        EntitySeriesKind::Metric
    }

    fn add_value(
        &mut self,
        bucket_start: Time,
        pid_cid: PidCid,
        event: &EventData,
        _strings: &mut StringStore,
    ) {
        if let Some(bucket) = self.stats.get_mut(bucket_start) {
            bucket.0.entry(pid_cid).or_default().add(event.values());
        }
    }

    /// The value field holds one measurement, comma separated when it has
    /// several dimensions. A record without one is only usable as an
    /// explicit null.
    fn process_fields(&self, value: Option<&str>, event: &mut EventData) -> bool {
        let Some(value) = value else {
            return event.is_explicit_null();
        };
        let parsed: Result<Vec<f64>, _> = value.split(',').map(|x| x.trim().parse()).collect();
        match parsed {
            Ok(values) if values.iter().all(|x: &f64| x.is_finite()) => {
                event.set_values(values);
                true
            }
            _ => {
                trace!(value, "cannot parse metric value");
                false
            }
        }
    }

    fn resize(&mut self, people: usize, _attributes: usize) {
        if self.effective_sample_counts.len() < people {
            self.effective_sample_counts.resize(people, 0.0);
        }
    }

    fn start_new_bucket(&mut self, bucket_start: Time, skip_updates: bool) {
        if !skip_updates {
            let leaving = self.stats.queue().earliest_start();
            trace!(bucket_start = leaving, "updating effective sample counts");
            self.update_sample_counts(leaving);
        }
        self.stats.start_new_bucket(bucket_start);
    }

    fn sample(&mut self, bucket_start: Time) {
        self.stats.sample(bucket_start);
    }

    fn feature_data(
        &self,
        feature: Feature,
        time: Time,
        bucket_length: Time,
        _aggregates: &BucketAggregates,
    ) -> Option<FeatureValues> {
        let value: fn(&MetricStats) -> Vec<f64> = match feature {
            Feature::MeanByPerson => MetricStats::mean,
            Feature::MinByPerson => |stats| stats.min.clone(),
            Feature::MaxByPerson => |stats| stats.max.clone(),
            Feature::SumByBucketAndPerson => |stats| stats.sum.clone(),
            _ => return None,
        };
        Some(FeatureValues::PairMetrics(
            self.stats
                .get(time, bucket_length)
                .map(|bucket| bucket.values(value))
                .unwrap_or_default(),
        ))
    }

    fn recycle_people(&mut self, pids: &[PersonId]) {
        for pid in pids {
            if let Some(count) = self.effective_sample_counts.get_mut(*pid) {
                *count = 0.0;
            }
        }
        self.stats.retain_pairs(person_not_in(pids));
    }

    fn remove_people(&mut self, lowest: PersonId) {
        self.effective_sample_counts.truncate(lowest);
        self.stats.retain_pairs(|(pid, _)| pid < lowest);
    }

    fn recycle_attributes(&mut self, cids: &[AttributeId]) {
        self.stats.retain_pairs(attribute_not_in(cids));
    }

    fn remove_attributes(&mut self, lowest: AttributeId) {
        self.stats.retain_pairs(|(_, cid)| cid < lowest);
    }

    fn reset_bucket(&mut self, bucket_start: Time) {
        self.stats.reset_bucket(bucket_start);
    }

    fn release_memory(&mut self, cutoff: Time) -> usize {
        self.stats.release_memory(cutoff)
    }

    fn clear(&mut self) {
        self.stats.clear();
        self.effective_sample_counts.clear();
    }

    fn reset_window(&mut self, latest: Time) {
        self.stats.reset(latest);
    }

    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        self.stats.accept_persist_inserter(inserter, |bucket, inserter| {
            bucket.accept_persist_inserter(inserter)
        });
        inserter.insert_level(Tag::SampleCounts, |inserter| {
            for (pid, count) in self.effective_sample_counts.iter().enumerate() {
                if *count != 0.0 {
                    inserter.insert_level(Tag::Entry, |inserter| {
                        inserter.insert_value(Tag::Pid, pid);
                        inserter.insert_value(Tag::Value, count);
                    });
                }
            }
        });
    }
}

impl Checksum for MetricSeries {
    fn checksum(&self) -> u64 {
        checksum::ordered(
            self.stats.checksum(),
            self.effective_sample_counts
                .iter()
                .enumerate()
                .filter(|(_, count)| **count != 0.0)
                .map(|(pid, count)| {
                    checksum::combine(checksum::hash_of(&pid), checksum::hash_f64(*count))
                }),
        )
    }
}

impl MemoryUsage for MetricSeries {
    fn memory_usage(&self) -> usize {
        self.stats.memory_usage()
            + self.effective_sample_counts.capacity() * std::mem::size_of::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(latency_buckets: usize) -> MetricSeries {
        let config = GathererConfig {
            bucket_length: std::time::Duration::from_secs(60),
            latency_buckets,
            ..Default::default()
        };
        MetricSeries::new(&config, 0)
    }

    fn add(series: &mut MetricSeries, bucket_start: Time, pid_cid: PidCid, values: &[f64]) {
        let event = EventData::new(bucket_start).with_values(values.iter().copied());
        series.add_value(bucket_start, pid_cid, &event, &mut StringStore::new());
    }

    #[test]
    fn test_stats_element_wise() {
        let mut stats = MetricStats::default();
        stats.add(&[1.0, 10.0]);
        stats.add(&[3.0, 5.0]);
        stats.add(&[]);
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.sum(), &[4.0, 15.0]);
        assert_eq!(stats.min(), &[1.0, 5.0]);
        assert_eq!(stats.max(), &[3.0, 10.0]);
        assert_eq!(stats.mean(), vec![2.0, 7.5]);
    }

    #[test]
    fn test_feature_data() {
        let mut series = series(0);
        add(&mut series, 0, (1, 0), &[2.0]);
        add(&mut series, 0, (1, 0), &[4.0]);
        add(&mut series, 0, (0, 1), &[1.0]);
        let aggregates = BucketAggregates::default();
        let mean = series.feature_data(Feature::MeanByPerson, 0, 60, &aggregates);
        assert_eq!(
            mean,
            Some(FeatureValues::PairMetrics(vec![
                (
                    (0, 1),
                    MetricValue {
                        value: vec![1.0],
                        count: 1
                    }
                ),
                (
                    (1, 0),
                    MetricValue {
                        value: vec![3.0],
                        count: 2
                    }
                ),
            ]))
        );
        let max = series.feature_data(Feature::MaxByPerson, 0, 60, &aggregates);
        assert!(matches!(
            max,
            Some(FeatureValues::PairMetrics(values)) if values[1].1.value == vec![4.0]
        ));
        let empty = series.feature_data(Feature::SumByBucketAndPerson, 600, 60, &aggregates);
        assert_eq!(empty, Some(FeatureValues::PairMetrics(vec![])));
        assert_eq!(
            series.feature_data(Feature::CountByBucketAndPerson, 0, 60, &aggregates),
            None
        );
    }

    #[test]
    fn test_effective_sample_count() {
        let mut series = series(1);
        let mut start = 0;
        for _ in 0..20 {
            for _ in 0..4 {
                add(&mut series, start, (0, 0), &[1.0]);
            }
            start += 60;
            series.start_new_bucket(start, false);
        }
        assert_eq!(series.effective_sample_count(0), 4.0);
        assert_eq!(series.effective_sample_count(1), 0.0);
    }

    #[test]
    fn test_process_fields_parses_values() {
        let series = series(0);
        let mut event = EventData::new(5);
        assert!(series.process_fields(Some("1.5, -2"), &mut event));
        assert_eq!(event.values(), &[1.5, -2.0]);

        let mut event = EventData::new(5);
        assert!(!series.process_fields(Some("abc"), &mut event));
        assert!(!series.process_fields(Some("NaN"), &mut event));
        assert!(!series.process_fields(None, &mut event));
        assert!(event.values().is_empty());

        let mut event = EventData::new(5).with_explicit_null(true);
        assert!(series.process_fields(None, &mut event));
    }

    #[test]
    fn test_skip_updates_leaves_sample_count() {
        let mut series = series(0);
        add(&mut series, 0, (0, 0), &[1.0]);
        series.start_new_bucket(60, true);
        assert_eq!(series.effective_sample_count(0), 0.0);
        add(&mut series, 60, (0, 0), &[1.0]);
        add(&mut series, 60, (0, 0), &[1.0]);
        series.start_new_bucket(120, false);
        assert_eq!(series.effective_sample_count(0), 2.0);
    }

    #[test]
    fn test_persist_restore() {
        let config = GathererConfig {
            bucket_length: std::time::Duration::from_secs(60),
            latency_buckets: 1,
            multi_bucket_lengths: vec![std::time::Duration::from_secs(120)],
            ..Default::default()
        };
        let mut series = MetricSeries::new(&config, 0);
        add(&mut series, 0, (0, 0), &[1.5, -2.25]);
        series.sample(0);
        series.start_new_bucket(60, false);
        add(&mut series, 60, (1, 0), &[0.1]);
        series.start_new_bucket(120, false);
        let mut inserter = StateInserter::new();
        series.accept_persist_inserter(&mut inserter);
        let stream = inserter.finish();
        let restored = MetricSeries::restore(&config, stream.traverser()).unwrap();
        assert_eq!(restored, series);
        assert_eq!(restored.checksum(), series.checksum());
        assert_eq!(restored.effective_sample_count(0), 1.0);
    }
}
