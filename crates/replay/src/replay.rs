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


//! Feeds records through a [`BucketGatherer`], sampling every bucket once it
//! leaves the latency window and writing out its features.

use serde::{Deserialize, Serialize};
use sieve_gatherer::{
    series::FeatureValues,
    time::{bucket_start, display_time},
    BucketGatherer, DenseIdRegistry, EntitySeriesKind, EventData, Feature, GathererConfig, Time,
};
use std::{io, sync::Arc};
use tracing::{debug, info};

/// One line of the input file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: Time,

    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub person: Option<String>,

    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub attribute: Option<String>,

    /// The raw value field, interpreted by the gatherer's series
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,

    /// A missing count means one, an explicit null means the record carries
    /// no count at all
    #[serde(default = "default_count")]
    pub count: Option<u64>,

    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub string_value: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub influences: Vec<Option<String>>,

    #[serde(default)]
    pub explicit_null: bool,
}

const fn default_count() -> Option<u64> {
    Some(1)
}

/// One line of the output: the values of a feature for a bucket or span
#[derive(Debug, Serialize)]
struct FeatureLine<'a> {
    bucket_start: String,
    bucket_length: Time,
    feature: Feature,
    values: &'a FeatureValues,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: u64,
    pub late_records: u64,
    pub unusable_records: u64,
    pub sampled_buckets: u64,
    pub skipped_buckets: u64,
    pub feature_lines: u64,
}

pub struct Replayer<W> {
    kind: EntitySeriesKind,
    config: GathererConfig,
    spans: Vec<Time>,
    gatherer: Option<BucketGatherer>,
    registry: DenseIdRegistry,
    next_sample: Time,
    output: W,
    stats: ReplayStats,
}

impl<W: io::Write> Replayer<W> {
    pub fn new(kind: EntitySeriesKind, config: GathererConfig, output: W) -> anyhow::Result<Self> {
        config.validate(kind)?;
        let spans = config.multi_bucket_lengths_secs();
        Ok(Self {
            kind,
            config,
            spans,
            gatherer: None,
            registry: DenseIdRegistry::new(),
            next_sample: 0,
            output,
            stats: ReplayStats::default(),
        })
    }

    pub fn replay(&mut self, record: &Record) -> anyhow::Result<()> {
        self.stats.records += 1;
        if self.gatherer.is_none() {
            let gatherer = BucketGatherer::new(self.kind, self.config.clone(), record.time)?;
            self.next_sample = gatherer.current_bucket_start_time();
            info!(
                kind = %self.kind,
                start = %display_time(self.next_sample),
                "gathering started"
            );
            self.gatherer = Some(gatherer);
        }
        self.sample_until(record.time)?;
        let mut event = self.event_data(record);
        let Some(gatherer) = self.gatherer.as_mut() else {
            return Ok(());
        };
        if record.value.is_some() && !gatherer.process_fields(record.value.as_deref(), &mut event)
        {
            debug!(time = record.time, "skipping record with an unusable value");
            self.stats.unusable_records += 1;
            return Ok(());
        }
        if !gatherer.add_event_data(&event, &self.registry)? {
            self.stats.late_records += 1;
        }
        Ok(())
    }

    /// Sample every bucket still open and hand back the gatherer
    pub fn finish(mut self) -> anyhow::Result<(Option<BucketGatherer>, ReplayStats)> {
        if let Some(current) = self
            .gatherer
            .as_ref()
            .map(BucketGatherer::current_bucket_start_time)
        {
            self.sample_through(current)?;
        }
        self.output.flush()?;
        info!(
            records = self.stats.records,
            late_records = self.stats.late_records,
            unusable_records = self.stats.unusable_records,
            sampled_buckets = self.stats.sampled_buckets,
            skipped_buckets = self.stats.skipped_buckets,
            feature_lines = self.stats.feature_lines,
            "replay finished"
        );
        Ok((self.gatherer, self.stats))
    }

    fn event_data(&mut self, record: &Record) -> EventData {
        let mut event = EventData::new(record.time)
            .with_values(record.values.iter().copied())
            .with_count(record.count)
            .with_explicit_null(record.explicit_null)
            .with_influences(
                record
                    .influences
                    .iter()
                    .map(|influence| influence.as_deref().map(Arc::<str>::from))
                    .collect(),
            );
        if let Some(person) = &record.person {
            event = event.with_person(self.registry.add_person(person));
        }
        if let Some(attribute) = &record.attribute {
            event = event.with_attribute(self.registry.add_attribute(attribute));
        }
        if let Some(value) = &record.string_value {
            event = event.with_string_value(value.as_str());
        }
        event
    }

    /// Sample the buckets a record at `time` pushes out of the latency window
    fn sample_until(&mut self, time: Time) -> anyhow::Result<()> {
        let Some(gatherer) = self.gatherer.as_ref() else {
            return Ok(());
        };
        let bucket_length = gatherer.bucket_length();
        let window = (gatherer.latency_buckets() as Time + 1) * bucket_length;
        self.sample_through(bucket_start(time, bucket_length) - window)
    }

    fn sample_through(&mut self, last: Time) -> anyhow::Result<()> {
        while self.next_sample <= last {
            self.sample_bucket(self.next_sample)?;
        }
        Ok(())
    }

    fn sample_bucket(&mut self, start: Time) -> anyhow::Result<()> {
        let Some(gatherer) = self.gatherer.as_mut() else {
            return Ok(());
        };
        let bucket_length = gatherer.bucket_length();
        self.next_sample = start + bucket_length;
        if !gatherer.data_available(start) {
            debug!(bucket_start = %display_time(start), "no data yet, skipping bucket");
            gatherer.skip_sample_now(start);
            self.stats.skipped_buckets += 1;
            return Ok(());
        }
        gatherer.sample_now(start);
        self.stats.sampled_buckets += 1;
        let mut lengths = vec![bucket_length];
        lengths.extend(
            self.spans
                .iter()
                .copied()
                .filter(|span| (start + bucket_length).rem_euclid(*span) == 0),
        );
        for length in lengths {
            for (feature, values) in gatherer.feature_data(start, length) {
                if values.is_empty() {
                    continue;
                }
                let line = FeatureLine {
                    bucket_start: display_time(bucket_start(start, length)),
                    bucket_length: length,
                    feature,
                    values: &values,
                };
                serde_json::to_writer(&mut self.output, &line)?;
                self.output.write_all(b"\n")?;
                self.stats.feature_lines += 1;
            }
        }
        gatherer.release_memory(start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_gatherer::Checksum;
    use std::time::Duration;

    fn config(latency_buckets: usize, spans: &[u64]) -> GathererConfig {
        GathererConfig {
            bucket_length: Duration::from_secs(60),
            latency_buckets,
            multi_bucket_lengths: spans.iter().map(|span| Duration::from_secs(*span)).collect(),
            ..Default::default()
        }
    }

    fn record(time: Time, person: &str) -> Record {
        Record {
            time,
            person: Some(person.to_string()),
            attribute: Some("login".to_string()),
            value: None,
            values: vec![],
            count: Some(1),
            string_value: None,
            influences: vec![],
            explicit_null: false,
        }
    }

    fn lines(output: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_record_defaults() {
        let record: Record =
            serde_json::from_str(r#"{"time": 10, "person": "alice", "attribute": "login"}"#)
                .unwrap();
        assert_eq!(record, self::record(10, "alice"));

        let record: Record = serde_json::from_str(r#"{"time": 10, "count": null}"#).unwrap();
        assert_eq!(record.count, None);
        assert_eq!(record.person, None);
    }

    #[test]
    fn test_every_bucket_is_sampled_once() {
        let mut output = Vec::new();
        let mut replayer =
            Replayer::new(EntitySeriesKind::EventRate, config(1, &[]), &mut output).unwrap();
        for time in [0, 10, 70, 130, 250] {
            replayer.replay(&record(time, "alice")).unwrap();
        }
        let (gatherer, stats) = replayer.finish().unwrap();
        assert!(gatherer.is_some());
        // buckets 0, 60, 120, 180 and 240
        assert_eq!(stats.sampled_buckets, 5);
        assert_eq!(stats.skipped_buckets, 0);
        assert_eq!(stats.late_records, 0);

        let lines = lines(&output);
        let starts: Vec<&str> = lines
            .iter()
            .map(|line| line["bucket_start"].as_str().unwrap())
            .collect();
        // the bucket starting at 180 is empty and writes nothing
        assert_eq!(
            starts,
            vec![
                "1970-01-01T00:00:00Z",
                "1970-01-01T00:01:00Z",
                "1970-01-01T00:02:00Z",
                "1970-01-01T00:04:00Z",
            ]
        );
        assert_eq!(lines[0]["feature"], "count_by_bucket_and_person");
        assert_eq!(lines[0]["values"]["person_counts"][0][1], 2);
    }

    #[test]
    fn test_late_records_are_counted() {
        let mut output = Vec::new();
        let mut replayer =
            Replayer::new(EntitySeriesKind::EventRate, config(0, &[]), &mut output).unwrap();
        replayer.replay(&record(100, "alice")).unwrap();
        replayer.replay(&record(200, "alice")).unwrap();
        replayer.replay(&record(30, "bob")).unwrap();
        let (_, stats) = replayer.finish().unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.late_records, 1);
    }

    #[test]
    fn test_spans_are_written_when_they_end() {
        let mut output = Vec::new();
        let mut replayer =
            Replayer::new(EntitySeriesKind::EventRate, config(0, &[180]), &mut output).unwrap();
        for time in [0, 60, 120, 180] {
            replayer.replay(&record(time, "alice")).unwrap();
        }
        replayer.finish().unwrap();

        let spans: Vec<serde_json::Value> = lines(&output)
            .into_iter()
            .filter(|line| line["bucket_length"] == 180)
            .collect();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0]["bucket_start"], "1970-01-01T00:00:00Z");
        assert_eq!(spans[0]["values"]["person_counts"][0][1], 3);
    }

    #[test]
    fn test_value_field_is_interpreted_by_the_series() {
        let mut output = Vec::new();
        let mut replayer =
            Replayer::new(EntitySeriesKind::Metric, config(0, &[]), &mut output).unwrap();
        for (time, value) in [(5, "2"), (10, "not a number"), (20, "4")] {
            let mut record = record(time, "alice");
            record.value = Some(value.to_string());
            replayer.replay(&record).unwrap();
        }
        let (_, stats) = replayer.finish().unwrap();
        assert_eq!(stats.unusable_records, 1);

        let lines = lines(&output);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["feature"], "mean_by_person");
        let mean = &lines[0]["values"]["pair_metrics"][0][1];
        assert_eq!(mean["value"][0], 3.0);
        assert_eq!(mean["count"], 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config(0, &[]);
        config.features = vec![Feature::MeanByPerson];
        assert!(Replayer::new(EntitySeriesKind::EventRate, config, io::sink()).is_err());
    }

    #[test]
    fn test_final_state_survives_snapshot() {
        let mut replayer =
            Replayer::new(EntitySeriesKind::Metric, config(2, &[300]), io::sink()).unwrap();
        for (time, value) in [(5, 1.0), (65, 2.0), (40, 3.0), (200, 4.0)] {
            let mut record = record(time, "alice");
            record.values = vec![value];
            replayer.replay(&record).unwrap();
        }
        let (gatherer, _) = replayer.finish().unwrap();
        let gatherer = gatherer.unwrap();
        let snapshot = gatherer.clone_for_snapshot();
        let json = snapshot.persist().to_json().unwrap();
        let stream = sieve_gatherer::persist::TaggedStream::from_json(&json).unwrap();
        let restored =
            BucketGatherer::restore(EntitySeriesKind::Metric, config(2, &[300]), &stream).unwrap();
        assert_eq!(restored.checksum(), snapshot.checksum());
    }
}
