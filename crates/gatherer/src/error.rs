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

//! Error types of the gathering engine.
//!
//! Late data is not an error: it is a normal occurrence reported through the
//! boolean status of [`crate::gatherer::BucketGatherer::add_event_data`].

use crate::config::ConfigurationError;
use crate::persist::Tag;
use crate::registry::{AttributeId, PersonId};

/// Errors raised while ingesting records.
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum GathererError {
    #[strum(to_string = "person id {0} was never allocated by the registry")]
    UnknownPerson(PersonId),

    #[strum(to_string = "attribute id {0} was never allocated by the registry")]
    UnknownAttribute(AttributeId),

    #[strum(to_string = "cannot grow {what} to hold id {requested}, limit is {limit}")]
    CapacityExhausted {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    #[strum(to_string = "event data has no time")]
    MissingTime,
}

impl std::error::Error for GathererError {}

/// Errors raised while persisting or restoring state.
///
/// Any of these aborts the whole restore, a partially restored gatherer is
/// never handed back to the caller.
#[derive(Debug, strum_macros::Display)]
pub enum PersistError {
    #[strum(to_string = "unrecognized state tag '{0}'")]
    UnrecognizedTag(String),

    #[strum(to_string = "state tag '{0}' is not expected at this level")]
    UnexpectedTag(Tag),

    #[strum(to_string = "state tag '{0}' is missing")]
    MissingTag(Tag),

    #[strum(to_string = "invalid value '{value}' for state tag '{tag}'")]
    InvalidValue { tag: Tag, value: String },

    #[strum(to_string = "state tag '{0}' should hold a nested level")]
    ExpectedLevel(Tag),

    #[strum(to_string = "state tag '{0}' should hold a value")]
    ExpectedValue(Tag),

    #[strum(to_string = "persisted gatherer kind is '{found}', expected '{expected}'")]
    KindMismatch { expected: Tag, found: Tag },

    #[strum(to_string = "cannot restore with an invalid configuration: {0}")]
    InvalidConfiguration(ConfigurationError),

    #[strum(to_string = "serde json error: {0}")]
    SerdeJson(serde_json::Error),

    #[strum(to_string = "cbor serialization error: {0}")]
    CborSerialize(String),

    #[strum(to_string = "cbor deserialization error: {0}")]
    CborDeserialize(String),

    #[strum(to_string = "io error: {0}")]
    Io(std::io::Error),
}

impl std::error::Error for PersistError {}

impl From<ConfigurationError> for PersistError {
    fn from(err: ConfigurationError) -> Self {
        PersistError::InvalidConfiguration(err)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::SerdeJson(err)
    }
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Io(err)
    }
}

impl<E: std::fmt::Debug> From<ciborium::ser::Error<E>> for PersistError {
    fn from(err: ciborium::ser::Error<E>) -> Self {
        PersistError::CborSerialize(format!("{err:?}"))
    }
}

impl<E: std::fmt::Debug> From<ciborium::de::Error<E>> for PersistError {
    fn from(err: ciborium::de::Error<E>) -> Self {
        PersistError::CborDeserialize(format!("{err:?}"))
    }
}
