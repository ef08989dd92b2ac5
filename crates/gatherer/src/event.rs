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

use crate::registry::{AttributeId, PersonId};
use crate::time::Time;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

/// The values carried by one record, usually a single one
pub type Values = SmallVec<[f64; 1]>;

/// A record whose entities have already been resolved to ids.
///
/// A record without a person, an attribute or a count is accepted but ignores
/// the bucket contents. Influences are positional: the value at index `i`
/// belongs to the `i`th influencing field, `None` when the field was absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    time: Option<Time>,
    person_id: Option<PersonId>,
    attribute_id: Option<AttributeId>,
    values: Values,
    count: Option<u64>,
    string_value: Option<String>,
    influences: Vec<Option<Arc<str>>>,
    is_explicit_null: bool,
}

impl EventData {
    /// A record at `time` counting a single occurrence
    pub fn new(time: Time) -> Self {
        Self {
            time: Some(time),
            count: Some(1),
            ..Default::default()
        }
    }

    pub fn with_person(mut self, person_id: PersonId) -> Self {
        self.person_id = Some(person_id);
        self
    }

    pub fn with_attribute(mut self, attribute_id: AttributeId) -> Self {
        self.attribute_id = Some(attribute_id);
        self
    }

    pub fn with_values<I: IntoIterator<Item = f64>>(mut self, values: I) -> Self {
        self.values = values.into_iter().collect();
        self
    }

    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    pub fn with_string_value(mut self, value: impl Into<String>) -> Self {
        self.string_value = Some(value.into());
        self
    }

    pub fn with_influences(mut self, influences: Vec<Option<Arc<str>>>) -> Self {
        self.influences = influences;
        self
    }

    pub fn with_explicit_null(mut self, is_explicit_null: bool) -> Self {
        self.is_explicit_null = is_explicit_null;
        self
    }

    pub fn set_time(&mut self, time: Time) {
        self.time = Some(time);
    }

    pub fn set_values<I: IntoIterator<Item = f64>>(&mut self, values: I) {
        self.values = values.into_iter().collect();
    }

    pub fn set_string_value(&mut self, value: impl Into<String>) {
        self.string_value = Some(value.into());
    }

    pub fn time(&self) -> Option<Time> {
        self.time
    }

    pub fn person_id(&self) -> Option<PersonId> {
        self.person_id
    }

    pub fn attribute_id(&self) -> Option<AttributeId> {
        self.attribute_id
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn count(&self) -> Option<u64> {
        self.count
    }

    pub fn string_value(&self) -> Option<&str> {
        self.string_value.as_deref()
    }

    pub fn influences(&self) -> &[Option<Arc<str>>] {
        &self.influences
    }

    pub fn is_explicit_null(&self) -> bool {
        self.is_explicit_null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let event = EventData::new(65)
            .with_person(1)
            .with_attribute(2)
            .with_values([1.5, 2.5])
            .with_string_value("x")
            .with_influences(vec![Some(Arc::from("host")), None]);
        assert_eq!(event.time(), Some(65));
        assert_eq!(event.count(), Some(1));
        assert_eq!(event.values(), &[1.5, 2.5]);
        assert_eq!(event.string_value(), Some("x"));
        assert_eq!(event.influences().len(), 2);
        assert!(!event.is_explicit_null());
    }

    #[test]
    fn test_default_has_no_time() {
        let event = EventData::default();
        assert_eq!(event.time(), None);
        assert_eq!(event.count(), None);
    }
}
