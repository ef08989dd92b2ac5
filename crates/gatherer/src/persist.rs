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

//! Tagged key/value persistence of gatherer state.
//!
//! State is written as an ordered tree of named nodes: leaves hold a textual
//! value and levels hold nested nodes. Every tag name comes from the single
//! [`Tag`] table, used both when writing and when reading, so serializer and
//! deserializer cannot drift apart. Tag names are an on-disk contract: never
//! rename one, only add new ones.
//!
//! ```text
//! let mut inserter = StateInserter::new();
//! gatherer.accept_persist_inserter(&mut inserter);
//! let json = inserter.finish().to_json()?;
//!
//! let stream = TaggedStream::from_json(&json)?;
//! let restored = BucketGatherer::restore(kind, config, &stream)?;
//! ```

use crate::error::PersistError;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, io, str::FromStr};

/// Every tag that may appear in persisted state
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
    strum_macros::EnumIter,
)]
pub enum Tag {
    #[strum(serialize = "event_rate_bucket_gatherer")]
    EventRateGatherer,
    #[strum(serialize = "metric_bucket_gatherer")]
    MetricGatherer,
    #[strum(serialize = "bucket_length")]
    BucketLength,
    #[strum(serialize = "bucket_start")]
    BucketStart,
    #[strum(serialize = "earliest_time")]
    EarliestTime,
    #[strum(serialize = "bucket_queue")]
    BucketQueue,
    #[strum(serialize = "latest_start")]
    LatestStart,
    #[strum(serialize = "bucket")]
    Bucket,
    #[strum(serialize = "time")]
    Time,
    #[strum(serialize = "counts")]
    Counts,
    #[strum(serialize = "explicit_nulls")]
    ExplicitNulls,
    #[strum(serialize = "influencers")]
    Influencers,
    #[strum(serialize = "influence_field")]
    InfluenceField,
    #[strum(serialize = "entry")]
    Entry,
    #[strum(serialize = "pid")]
    Pid,
    #[strum(serialize = "cid")]
    Cid,
    #[strum(serialize = "value")]
    Value,
    #[strum(serialize = "influence")]
    Influence,
    #[strum(serialize = "multi_bucket")]
    MultiBucket,
    #[strum(serialize = "span")]
    Span,
    #[strum(serialize = "span_start")]
    SpanStart,
    #[strum(serialize = "series")]
    Series,
    #[strum(serialize = "string")]
    StringValue,
    #[strum(serialize = "n")]
    MeasurementCount,
    #[strum(serialize = "sum")]
    Sum,
    #[strum(serialize = "min")]
    Min,
    #[strum(serialize = "max")]
    Max,
    #[strum(serialize = "sample_counts")]
    SampleCounts,
}

/// The payload of a node: either a leaf value or a nested level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    Value(String),
    Level(Vec<StateNode>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    pub tag: String,
    pub value: StateValue,
}

/// A complete persisted document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaggedStream {
    nodes: Vec<StateNode>,
}

impl TaggedStream {
    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    pub fn traverser(&self) -> StateTraverser<'_> {
        StateTraverser::new(&self.nodes)
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_writer<W: io::Write>(&self, writer: W) -> Result<(), PersistError> {
        Ok(serde_json::to_writer(writer, self)?)
    }

    pub fn from_json_reader<R: io::Read>(reader: R) -> Result<Self, PersistError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, PersistError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, PersistError> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// Builds a [`TaggedStream`] in insertion order
#[derive(Debug, Default)]
pub struct StateInserter {
    nodes: Vec<StateNode>,
}

impl StateInserter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_value<V: Display>(&mut self, tag: Tag, value: V) {
        self.nodes.push(StateNode {
            tag: <&'static str>::from(tag).to_string(),
            value: StateValue::Value(value.to_string()),
        });
    }

    /// Insert a nested level whose contents are written by `f`
    pub fn insert_level<F: FnOnce(&mut StateInserter)>(&mut self, tag: Tag, f: F) {
        let mut child = StateInserter::new();
        f(&mut child);
        self.nodes.push(StateNode {
            tag: <&'static str>::from(tag).to_string(),
            value: StateValue::Level(child.nodes),
        });
    }

    pub fn finish(self) -> TaggedStream {
        TaggedStream { nodes: self.nodes }
    }
}

/// Walks the nodes of one level in order, resolving each tag name against
/// [`Tag`]. An unknown name yields [`PersistError::UnrecognizedTag`].
#[derive(Debug, Clone)]
pub struct StateTraverser<'a> {
    nodes: std::slice::Iter<'a, StateNode>,
}

impl<'a> StateTraverser<'a> {
    pub fn new(nodes: &'a [StateNode]) -> Self {
        Self {
            nodes: nodes.iter(),
        }
    }
}

impl<'a> Iterator for StateTraverser<'a> {
    type Item = Result<StateEntry<'a>, PersistError>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.next()?;
        Some(
            Tag::from_str(&node.tag)
                .map(|tag| StateEntry {
                    tag,
                    value: &node.value,
                })
                .map_err(|_| PersistError::UnrecognizedTag(node.tag.clone())),
        )
    }
}

/// A node whose tag has been resolved
#[derive(Debug, Clone, Copy)]
pub struct StateEntry<'a> {
    pub tag: Tag,
    value: &'a StateValue,
}

impl<'a> StateEntry<'a> {
    pub fn text(&self) -> Result<&'a str, PersistError> {
        match self.value {
            StateValue::Value(value) => Ok(value.as_str()),
            StateValue::Level(_) => Err(PersistError::ExpectedValue(self.tag)),
        }
    }

    pub fn parse<T: FromStr>(&self) -> Result<T, PersistError> {
        let text = self.text()?;
        text.parse().map_err(|_| PersistError::InvalidValue {
            tag: self.tag,
            value: text.to_string(),
        })
    }

    pub fn level(&self) -> Result<StateTraverser<'a>, PersistError> {
        match self.value {
            StateValue::Level(nodes) => Ok(StateTraverser::new(nodes)),
            StateValue::Value(_) => Err(PersistError::ExpectedLevel(self.tag)),
        }
    }

    /// Parse a comma separated list of floats, as written by [`join_f64`]
    pub fn parse_f64s(&self) -> Result<Vec<f64>, PersistError> {
        let text = self.text()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        text.split(',')
            .map(|x| {
                x.parse().map_err(|_| PersistError::InvalidValue {
                    tag: self.tag,
                    value: text.to_string(),
                })
            })
            .collect()
    }
}

/// Write floats so that they parse back to the identical bit pattern. NaN
/// payloads are not kept, the gatherer never stores a NaN.
pub fn join_f64(values: &[f64]) -> String {
    values
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Unwrap a required field collected during a traversal
pub(crate) fn required<T>(value: Option<T>, tag: Tag) -> Result<T, PersistError> {
    value.ok_or(PersistError::MissingTag(tag))
}
