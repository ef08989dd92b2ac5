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

use rstest::rstest;
use sieve_gatherer::{
    persist::TaggedStream, time::bucket_start, BucketGatherer, Checksum, DenseIdRegistry,
    EntitySeriesKind, EventData, Feature, GathererConfig, PersistError, Time,
};
use std::sync::Arc;
use std::time::Duration;

const BUCKET_LENGTH: Time = 60;

fn config(latency_buckets: usize) -> GathererConfig {
    GathererConfig {
        bucket_length: Duration::from_secs(BUCKET_LENGTH as u64),
        latency_buckets,
        ..Default::default()
    }
}

fn registry(people: usize, attributes: usize) -> DenseIdRegistry {
    let mut registry = DenseIdRegistry::new();
    for i in 0..people {
        registry.add_person(&format!("person{i}"));
    }
    for i in 0..attributes {
        registry.add_attribute(&format!("attribute{i}"));
    }
    registry
}

fn event(time: Time, pid: usize, cid: usize) -> EventData {
    EventData::new(time).with_person(pid).with_attribute(cid)
}

/// A gatherer with counts, explicit nulls, influencers and string values in
/// several buckets
fn populated(kind: EntitySeriesKind) -> (BucketGatherer, DenseIdRegistry) {
    let registry = registry(6, 3);
    let config = GathererConfig {
        multi_bucket_lengths: vec![Duration::from_secs(3 * BUCKET_LENGTH as u64)],
        ..config(2)
    };
    let mut gatherer = BucketGatherer::new(kind, config, 0).unwrap();
    let events = [
        event(5, 1, 1)
            .with_values([1.5, 2.0])
            .with_string_value("a")
            .with_influences(vec![Some(Arc::from("host1")), Some(Arc::from("user1"))]),
        event(7, 2, 0)
            .with_values([0.25])
            .with_count(Some(3))
            .with_influences(vec![Some(Arc::from("host1")), None]),
        event(8, 3, 2).with_explicit_null(true),
        event(65, 5, 1)
            .with_values([-4.0])
            .with_string_value("b")
            .with_influences(vec![Some(Arc::from("host2"))]),
        event(70, 1, 1).with_values([10.0]).with_string_value("a"),
        event(130, 4, 0).with_values([1e-3]),
    ];
    for event in &events {
        assert_eq!(gatherer.add_event_data(event, &registry), Ok(true));
    }
    gatherer.sample_now(0);
    (gatherer, registry)
}

#[rstest]
#[case(0, vec![5, 10, 59])]
#[case(1, vec![5, 65, 70, 130])]
#[case(2, vec![0, 60, 240, 250, 400])]
#[case(3, vec![-130, -5, 0, 181])]
fn test_time_advances_to_latest_bucket(#[case] latency_buckets: usize, #[case] times: Vec<Time>) {
    let mut gatherer =
        BucketGatherer::new(EntitySeriesKind::EventRate, config(latency_buckets), times[0])
            .unwrap();
    for time in times {
        assert!(gatherer.time_now(time));
        assert_eq!(
            gatherer.current_bucket_start_time(),
            bucket_start(time, BUCKET_LENGTH)
        );
        let mut probe = gatherer.clone();
        let mut start = gatherer.earliest_bucket_start_time();
        while start <= gatherer.current_bucket_start_time() {
            assert!(probe.reset_bucket(start), "bucket {start} is not retained");
            start += BUCKET_LENGTH;
        }
    }
}

#[test]
fn test_time_now_within_current_bucket_is_idempotent() {
    let (mut gatherer, _) = populated(EntitySeriesKind::EventRate);
    let current = gatherer.current_bucket_start_time();
    let checksum = gatherer.checksum();
    let persisted = gatherer.persist();
    for time in [current, current + 1, current + BUCKET_LENGTH - 1] {
        assert!(gatherer.time_now(time));
        assert_eq!(gatherer.current_bucket_start_time(), current);
        assert_eq!(gatherer.checksum(), checksum);
        assert_eq!(gatherer.persist(), persisted);
    }
}

#[rstest]
#[case(EntitySeriesKind::EventRate)]
#[case(EntitySeriesKind::Metric)]
fn test_persist_restore_round_trip(#[case] kind: EntitySeriesKind) {
    let (gatherer, _) = populated(kind);
    let json = gatherer.persist().to_json().unwrap();
    let stream = TaggedStream::from_json(&json).unwrap();
    let restored = BucketGatherer::restore(kind, gatherer.config().clone(), &stream).unwrap();
    assert_eq!(restored.checksum(), gatherer.checksum());
    assert_eq!(restored.persist(), gatherer.persist());
    assert_eq!(restored.earliest_time(), Some(5));
    assert_eq!(
        restored.current_bucket_start_time(),
        gatherer.current_bucket_start_time()
    );
    assert!(restored.has_explicit_nulls_only(0, 3, 2));
    assert_eq!(restored.influencer_counts(0), gatherer.influencer_counts(0));
    assert_eq!(restored.feature_data(0, 180), gatherer.feature_data(0, 180));

    let cbor = gatherer.persist().to_cbor().unwrap();
    let stream = TaggedStream::from_cbor(&cbor).unwrap();
    let restored = BucketGatherer::restore(kind, gatherer.config().clone(), &stream).unwrap();
    assert_eq!(restored.checksum(), gatherer.checksum());
}

#[test]
fn test_restored_gatherer_keeps_gathering() {
    let (mut gatherer, registry) = populated(EntitySeriesKind::EventRate);
    let stream = gatherer.persist();
    let mut restored =
        BucketGatherer::restore(EntitySeriesKind::EventRate, gatherer.config().clone(), &stream)
            .unwrap();
    let next = event(140, 1, 1)
        .with_string_value("c")
        .with_influences(vec![Some(Arc::from("host1"))]);
    assert_eq!(gatherer.add_event_data(&next, &registry), Ok(true));
    assert_eq!(restored.add_event_data(&next, &registry), Ok(true));
    gatherer.sample_now(60);
    restored.sample_now(60);
    assert_eq!(restored.checksum(), gatherer.checksum());
    assert_eq!(restored.feature_data(120, 60), gatherer.feature_data(120, 60));
}

#[test]
fn test_restore_fails_on_unrecognized_tag() {
    let (gatherer, _) = populated(EntitySeriesKind::EventRate);
    let json = gatherer
        .persist()
        .to_json()
        .unwrap()
        .replace("\"explicit_nulls\"", "\"no_such_tag\"");
    let stream = TaggedStream::from_json(&json).unwrap();
    let config = gatherer.config().clone();
    let err = BucketGatherer::restore(EntitySeriesKind::EventRate, config, &stream).unwrap_err();
    assert!(matches!(err, PersistError::UnrecognizedTag(tag) if tag == "no_such_tag"));
}

#[test]
fn test_late_record_is_rejected_without_changes() {
    let (mut gatherer, registry) = populated(EntitySeriesKind::EventRate);
    assert!(gatherer.time_now(300));
    assert_eq!(gatherer.earliest_bucket_start_time(), 180);
    let checksum = gatherer.checksum();
    for time in [0, 100, 179] {
        let late = event(time, 1, 1).with_influences(vec![Some(Arc::from("host1"))]);
        assert_eq!(gatherer.add_event_data(&late, &registry), Ok(false));
        assert_eq!(gatherer.checksum(), checksum);
    }
    assert_eq!(gatherer.add_event_data(&event(180, 1, 1), &registry), Ok(true));
    assert_ne!(gatherer.checksum(), checksum);
}

#[test]
fn test_recycle_people_removes_only_them() {
    let registry = registry(8, 2);
    let mut gatherer = BucketGatherer::new(EntitySeriesKind::EventRate, config(2), 0).unwrap();
    for time in [5, 65, 125] {
        for pid in [3, 5, 7] {
            let event = event(time, pid, 1).with_influences(vec![Some(Arc::from("host"))]);
            assert_eq!(gatherer.add_event_data(&event, &registry), Ok(true));
        }
    }
    gatherer.recycle_people(&[5]);
    for time in [0, 60, 120] {
        assert_eq!(gatherer.bucket_counts(time), vec![((3, 1), 1), ((7, 1), 1)]);
        assert!(gatherer
            .influencer_counts(time)
            .iter()
            .flatten()
            .all(|(((pid, _), _), _)| *pid != 5));
    }
}

#[test]
fn test_late_records_within_latency_window() {
    let registry = registry(3, 3);
    let mut gatherer = BucketGatherer::new(EntitySeriesKind::EventRate, config(2), 0).unwrap();
    assert_eq!(gatherer.add_event_data(&event(5, 1, 1), &registry), Ok(true));
    assert_eq!(gatherer.add_event_data(&event(65, 1, 2), &registry), Ok(true));
    assert_eq!(gatherer.current_bucket_start_time(), 60);
    assert_eq!(gatherer.earliest_bucket_start_time(), -60);
    assert_eq!(gatherer.add_event_data(&event(3, 2, 1), &registry), Ok(true));
    assert_eq!(gatherer.bucket_counts(0), vec![((1, 1), 1), ((2, 1), 1)]);
    assert_eq!(gatherer.bucket_counts(60), vec![((1, 2), 1)]);
}

#[test]
fn test_jump_evicts_old_buckets() {
    let registry = registry(1, 1);
    let mut gatherer = BucketGatherer::new(EntitySeriesKind::EventRate, config(2), 0).unwrap();
    for time in [5, 65, 125] {
        assert_eq!(gatherer.add_event_data(&event(time, 0, 0), &registry), Ok(true));
    }
    assert!(gatherer.time_now(125 + 5 * BUCKET_LENGTH));
    assert_eq!(gatherer.current_bucket_start_time(), 420);
    assert_eq!(gatherer.earliest_bucket_start_time(), 300);
    for time in [0, 60, 120, 300, 360, 420] {
        assert!(gatherer.bucket_counts(time).is_empty());
        assert!(gatherer.feature_data(time, BUCKET_LENGTH).iter().all(|(_, v)| v.is_empty()));
    }
    assert!(gatherer.feature_data(0, BUCKET_LENGTH).is_empty());
}

#[test]
fn test_multi_bucket_span_is_not_corrected_for_late_records() {
    let registry = registry(1, 1);
    let config = GathererConfig {
        multi_bucket_lengths: vec![Duration::from_secs(2 * BUCKET_LENGTH as u64)],
        features: vec![Feature::CountByBucketAndPerson],
        ..config(1)
    };
    let mut gatherer = BucketGatherer::new(EntitySeriesKind::EventRate, config, 0).unwrap();
    assert_eq!(gatherer.add_event_data(&event(5, 0, 0), &registry), Ok(true));
    gatherer.sample_now(0);
    // Still within the latency window of the single buckets
    assert_eq!(gatherer.add_event_data(&event(6, 0, 0), &registry), Ok(true));
    assert_eq!(gatherer.bucket_counts(0), vec![((0, 0), 2)]);

    let span = gatherer.feature_data(0, 2 * BUCKET_LENGTH);
    assert_eq!(span.len(), 1);
    assert_eq!(
        span[0].1,
        sieve_gatherer::series::FeatureValues::PersonCounts(vec![(0, 1)])
    );
}
