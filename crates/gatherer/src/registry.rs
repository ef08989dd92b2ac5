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

//! Seam to the collaborator that owns entity identity.
//!
//! Person and attribute ids are dense non-negative integers allocated and
//! recycled outside of the gatherer; the gatherer only references them. The
//! [`EntityRegistry`] trait is what the gatherer asks when a record arrives.
//! [`DenseIdRegistry`] is a small allocator implementing it, used by the replay
//! driver and in tests.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

pub type PersonId = usize;
pub type AttributeId = usize;

/// A (person, attribute) pair
pub type PidCid = (PersonId, AttributeId);

/// Lifecycle status of an entity id
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum EntityStatus {
    /// The id is allocated and live
    Active,
    /// The id was allocated once but has been recycled and not reused yet
    Recycled,
    /// The id was never allocated
    Unknown,
}

/// The owning id allocator, as seen from the gatherer
pub trait EntityRegistry {
    fn person_status(&self, pid: PersonId) -> EntityStatus;
    fn attribute_status(&self, cid: AttributeId) -> EntityStatus;
}

/// One dense id space with name lookup and id reuse
#[derive(Debug, Clone, Default)]
struct IdSpace {
    names: Vec<Option<String>>,
    index: FxHashMap<String, usize>,
    free: BTreeSet<usize>,
}

impl IdSpace {
    fn add(&mut self, name: &str) -> usize {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = match self.free.pop_first() {
            Some(id) => {
                self.names[id] = Some(name.to_string());
                id
            }
            None => {
                self.names.push(Some(name.to_string()));
                self.names.len() - 1
            }
        };
        self.index.insert(name.to_string(), id);
        id
    }

    fn recycle(&mut self, names: &[&str]) -> Vec<usize> {
        let mut ids: Vec<usize> = names
            .iter()
            .filter_map(|name| self.index.remove(*name))
            .collect();
        for id in &ids {
            self.names[*id] = None;
            self.free.insert(*id);
        }
        ids.sort_unstable();
        ids
    }

    fn remove_from(&mut self, lowest: usize) {
        for name in self.names.drain(lowest.min(self.names.len())..).flatten() {
            self.index.remove(&name);
        }
        self.free.retain(|id| *id < lowest);
    }

    fn status(&self, id: usize) -> EntityStatus {
        match self.names.get(id) {
            Some(Some(_)) => EntityStatus::Active,
            Some(None) => EntityStatus::Recycled,
            None => EntityStatus::Unknown,
        }
    }

    fn id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).and_then(|name| name.as_deref())
    }
}

/// Allocates dense person and attribute ids by name, reusing recycled ids
/// lowest first.
#[derive(Debug, Clone, Default)]
pub struct DenseIdRegistry {
    people: IdSpace,
    attributes: IdSpace,
}

impl DenseIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person(&mut self, name: &str) -> PersonId {
        self.people.add(name)
    }

    pub fn add_attribute(&mut self, name: &str) -> AttributeId {
        self.attributes.add(name)
    }

    pub fn person_id(&self, name: &str) -> Option<PersonId> {
        self.people.id(name)
    }

    pub fn attribute_id(&self, name: &str) -> Option<AttributeId> {
        self.attributes.id(name)
    }

    pub fn person_name(&self, pid: PersonId) -> Option<&str> {
        self.people.name(pid)
    }

    pub fn attribute_name(&self, cid: AttributeId) -> Option<&str> {
        self.attributes.name(cid)
    }

    /// Free the ids of the named people, returning them sorted so they can be
    /// passed straight to the gatherer's `recycle_people`
    pub fn recycle_people(&mut self, names: &[&str]) -> Vec<PersonId> {
        self.people.recycle(names)
    }

    pub fn recycle_attributes(&mut self, names: &[&str]) -> Vec<AttributeId> {
        self.attributes.recycle(names)
    }

    /// Shrink the person id space to `[0, lowest)`
    pub fn remove_people(&mut self, lowest: PersonId) {
        self.people.remove_from(lowest)
    }

    pub fn remove_attributes(&mut self, lowest: AttributeId) {
        self.attributes.remove_from(lowest)
    }
}

impl EntityRegistry for DenseIdRegistry {
    fn person_status(&self, pid: PersonId) -> EntityStatus {
        self.people.status(pid)
    }

    fn attribute_status(&self, cid: AttributeId) -> EntityStatus {
        self.attributes.status(cid)
    }
}
