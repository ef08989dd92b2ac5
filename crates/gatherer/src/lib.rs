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

//! Online aggregation of timestamped records into fixed-length buckets of
//! per-entity statistics.
//!
//! The entry point is [`gatherer::BucketGatherer`]: feed it resolved records
//! with [`gatherer::BucketGatherer::add_event_data`], drive time with
//! [`gatherer::BucketGatherer::sample_now`] and read closed buckets back with
//! [`gatherer::BucketGatherer::feature_data`].

pub mod aggregates;
pub mod bucket_queue;
pub mod checksum;
pub mod config;
pub mod error;
pub mod event;
pub mod gatherer;
pub mod interner;
pub mod memory;
pub mod overflow;
pub mod persist;
pub mod registry;
pub mod series;
pub mod time;
pub mod windowed;

pub use checksum::Checksum;
pub use config::{EntitySeriesKind, Feature, GathererConfig};
pub use error::{GathererError, PersistError};
pub use event::EventData;
pub use gatherer::{BucketGatherer, GathererSnapshot};
pub use memory::MemoryUsage;
pub use registry::{DenseIdRegistry, EntityRegistry, EntityStatus};
pub use time::Time;
