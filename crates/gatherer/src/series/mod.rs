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

//! The data series specific part of a gatherer.
//!
//! A gatherer keeps the generic per-bucket aggregates itself and delegates
//! everything that depends on the kind of series to an [`EntitySeries`]:
//! event rate series track distinct string values, metric series track
//! summary statistics of the measured values.

mod event_rate;
mod metric;

pub use event_rate::{EventRateSeries, UniqueStrings};
pub use metric::{MetricBucket, MetricSeries, MetricStats};

use crate::aggregates::BucketAggregates;
use crate::checksum::Checksum;
use crate::config::{EntitySeriesKind, Feature, GathererConfig};
use crate::error::PersistError;
use crate::event::EventData;
use crate::interner::StringStore;
use crate::memory::MemoryUsage;
use crate::persist::{StateInserter, StateTraverser, Tag};
use crate::registry::{AttributeId, PersonId, PidCid};
use crate::time::Time;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    /// One entry per dimension of the measured values
    pub value: Vec<f64>,
    /// Number of measurements summarised
    pub count: u64,
}

/// The values of one feature, sorted by key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureValues {
    PersonCounts(Vec<(PersonId, u64)>),
    PairCounts(Vec<(PidCid, u64)>),
    PairMetrics(Vec<(PidCid, MetricValue)>),
}

impl FeatureValues {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::PersonCounts(values) => values.is_empty(),
            Self::PairCounts(values) => values.is_empty(),
            Self::PairMetrics(values) => values.is_empty(),
        }
    }
}

/// The hooks a gatherer calls into its series
pub trait SeriesHooks: Checksum + MemoryUsage {
    fn kind(&self) -> EntitySeriesKind;

    /// Record `event` for `pid_cid` in the bucket starting at `bucket_start`.
    /// The bucket is known to be retained.
    fn add_value(
        &mut self,
        bucket_start: Time,
        pid_cid: PidCid,
        event: &EventData,
        strings: &mut StringStore,
    );

    /// Interpret the raw value field of a record, filling in `event`.
    /// Returns false if the series cannot use the record.
    fn process_fields(&self, value: Option<&str>, event: &mut EventData) -> bool;

    /// Make room for `people` people and `attributes` attributes
    fn resize(&mut self, people: usize, attributes: usize);

    /// Open the bucket starting at `bucket_start`. With `skip_updates` any
    /// update that would affect the models is suppressed.
    fn start_new_bucket(&mut self, bucket_start: Time, skip_updates: bool);

    fn sample(&mut self, bucket_start: Time);

    /// The values of `feature` for the `bucket_length` long interval
    /// containing `time`, `None` when the series does not support `feature`.
    fn feature_data(
        &self,
        feature: Feature,
        time: Time,
        bucket_length: Time,
        aggregates: &BucketAggregates,
    ) -> Option<FeatureValues>;

    /// `pids` must be sorted
    fn recycle_people(&mut self, pids: &[PersonId]);

    fn remove_people(&mut self, lowest: PersonId);

    /// `cids` must be sorted
    fn recycle_attributes(&mut self, cids: &[AttributeId]);

    fn remove_attributes(&mut self, lowest: AttributeId);

    fn reset_bucket(&mut self, bucket_start: Time);

    fn release_memory(&mut self, cutoff: Time) -> usize;

    fn clear(&mut self);

    /// Drop all buckets and move the window so that `latest` is in the newest
    fn reset_window(&mut self, latest: Time);

    fn accept_persist_inserter(&self, inserter: &mut StateInserter);
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntitySeries {
    EventRate(EventRateSeries),
    Metric(MetricSeries),
}

macro_rules! dispatch {
    ($self:ident, $series:ident => $body:expr) => {
        match $self {
            EntitySeries::EventRate($series) => $body,
            EntitySeries::Metric($series) => $body,
        }
    };
}

impl EntitySeries {
    pub fn new(kind: EntitySeriesKind, config: &GathererConfig, latest: Time) -> Self {
        match kind {
            EntitySeriesKind::EventRate => Self::EventRate(EventRateSeries::new(config, latest)),
            EntitySeriesKind::Metric => Self::Metric(MetricSeries::new(config, latest)),
        }
    }

    /// The tag wrapping the persisted state of a gatherer of this kind
    pub fn persistence_tag(&self) -> Tag {
        kind_tag(self.kind())
    }

    pub fn restore(
        kind: EntitySeriesKind,
        config: &GathererConfig,
        traverser: StateTraverser<'_>,
        strings: &mut StringStore,
    ) -> Result<Self, PersistError> {
        match kind {
            EntitySeriesKind::EventRate => Ok(Self::EventRate(EventRateSeries::restore(
                config, traverser, strings,
            )?)),
            EntitySeriesKind::Metric => Ok(Self::Metric(MetricSeries::restore(config, traverser)?)),
        }
    }

    pub fn as_metric(&self) -> Option<&MetricSeries> {
        match self {
            Self::Metric(series) => Some(series),
            Self::EventRate(_) => None,
        }
    }
}

pub fn kind_tag(kind: EntitySeriesKind) -> Tag {
    match kind {
        EntitySeriesKind::EventRate => Tag::EventRateGatherer,
        EntitySeriesKind::Metric => Tag::MetricGatherer,
    }
}

impl SeriesHooks for EntitySeries {
    fn kind(&self) -> EntitySeriesKind {
        dispatch!(self, series => series.kind())
    }

    fn add_value(
        &mut self,
        bucket_start: Time,
        pid_cid: PidCid,
        event: &EventData,
        strings: &mut StringStore,
    ) {
        dispatch!(self, series => series.add_value(bucket_start, pid_cid, event, strings))
    }

    fn process_fields(&self, value: Option<&str>, event: &mut EventData) -> bool {
        dispatch!(self, series => series.process_fields(value, event))
    }

    fn resize(&mut self, people: usize, attributes: usize) {
        dispatch!(self, series => series.resize(people, attributes))
    }

    fn start_new_bucket(&mut self, bucket_start: Time, skip_updates: bool) {
        dispatch!(self, series => series.start_new_bucket(bucket_start, skip_updates))
    }

    fn sample(&mut self, bucket_start: Time) {
        dispatch!(self, series => series.sample(bucket_start))
    }

    fn feature_data(
        &self,
        feature: Feature,
        time: Time,
        bucket_length: Time,
        aggregates: &BucketAggregates,
    ) -> Option<FeatureValues> {
        dispatch!(self, series => series.feature_data(feature, time, bucket_length, aggregates))
    }

    fn recycle_people(&mut self, pids: &[PersonId]) {
        dispatch!(self, series => series.recycle_people(pids))
    }

    fn remove_people(&mut self, lowest: PersonId) {
        dispatch!(self, series => series.remove_people(lowest))
    }

    fn recycle_attributes(&mut self, cids: &[AttributeId]) {
        dispatch!(self, series => series.recycle_attributes(cids))
    }

    fn remove_attributes(&mut self, lowest: AttributeId) {
        dispatch!(self, series => series.remove_attributes(lowest))
    }

    fn reset_bucket(&mut self, bucket_start: Time) {
        dispatch!(self, series => series.reset_bucket(bucket_start))
    }

    fn release_memory(&mut self, cutoff: Time) -> usize {
        dispatch!(self, series => series.release_memory(cutoff))
    }

    fn clear(&mut self) {
        dispatch!(self, series => series.clear())
    }

    fn reset_window(&mut self, latest: Time) {
        dispatch!(self, series => series.reset_window(latest))
    }

    fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        dispatch!(self, series => series.accept_persist_inserter(inserter))
    }
}

impl Checksum for EntitySeries {
    fn checksum(&self) -> u64 {
        dispatch!(self, series => series.checksum())
    }
}

impl MemoryUsage for EntitySeries {
    fn memory_usage(&self) -> usize {
        dispatch!(self, series => series.memory_usage())
    }
}

/// Count based features, computed from the generic bucket aggregates
pub(crate) fn count_feature_data(
    feature: Feature,
    aggregates: &BucketAggregates,
) -> Option<FeatureValues> {
    match feature {
        Feature::CountByBucketAndPerson => {
            Some(FeatureValues::PersonCounts(aggregates.person_non_zero_counts()))
        }
        Feature::NonZeroCountByBucketAndPerson => Some(FeatureValues::PersonCounts(
            aggregates
                .person_non_zero_counts()
                .into_iter()
                .map(|(pid, _)| (pid, 1))
                .collect(),
        )),
        Feature::CountByBucketPersonAndAttribute => {
            let mut counts: Vec<_> = aggregates
                .counts()
                .iter()
                .map(|(pid_cid, count)| (*pid_cid, *count))
                .collect();
            counts.sort_unstable();
            Some(FeatureValues::PairCounts(counts))
        }
        _ => None,
    }
}

/// Keep pairs whose person is not in the sorted `pids`
pub(crate) fn person_not_in(pids: &[PersonId]) -> impl Fn(PidCid) -> bool + '_ {
    move |(pid, _)| pids.binary_search(&pid).is_err()
}

/// Keep pairs whose attribute is not in the sorted `cids`
pub(crate) fn attribute_not_in(cids: &[AttributeId]) -> impl Fn(PidCid) -> bool + '_ {
    move |(_, cid)| cids.binary_search(&cid).is_err()
}
