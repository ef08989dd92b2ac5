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

//! The per-bucket aggregates held in the bucket queue.
//!
//! For one bucket this keeps:
//! - the non-zero occurrence count of every (person, attribute) pair; a pair
//!   that is absent has a zero count
//! - the pairs for which explicit null records were seen
//! - per influencing field, the count of every ((person, attribute), value)

use crate::checksum::{self, Checksum};
use crate::error::PersistError;
use crate::interner::StringStore;
use crate::memory::{map_usage, set_usage, MemoryUsage};
use crate::overflow::Merge;
use crate::persist::{required, StateInserter, StateTraverser, Tag};
use crate::registry::{PersonId, PidCid};
use crate::windowed::PairData;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// ((person, attribute), influencing field value)
pub type InfluenceKey = (PidCid, Arc<str>);

pub type PairCounts = FxHashMap<PidCid, u64>;

pub type InfluencerCounts = FxHashMap<InfluenceKey, u64>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketAggregates {
    counts: PairCounts,
    explicit_nulls: FxHashSet<PidCid>,
    influencers: Vec<InfluencerCounts>,
}

impl BucketAggregates {
    pub fn counts(&self) -> &PairCounts {
        &self.counts
    }

    pub fn explicit_nulls(&self) -> &FxHashSet<PidCid> {
        &self.explicit_nulls
    }

    /// Counts per influencing field, indexed by the field position
    pub fn influencers(&self) -> &[InfluencerCounts] {
        &self.influencers
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
            && self.explicit_nulls.is_empty()
            && self.influencers.iter().all(|x| x.is_empty())
    }

    pub fn add_count(&mut self, pid_cid: PidCid, count: u64) {
        if count > 0 {
            *self.counts.entry(pid_cid).or_insert(0) += count;
        }
    }

    pub fn mark_explicit_null(&mut self, pid_cid: PidCid) {
        self.explicit_nulls.insert(pid_cid);
    }

    /// Count `count` occurrences of each present influence for `pid_cid`.
    ///
    /// The influence at position `i` belongs to influencing field `i`.
    pub fn add_influences(&mut self, pid_cid: PidCid, influences: &[Option<Arc<str>>], count: u64) {
        if self.influencers.len() < influences.len() {
            self.influencers
                .resize_with(influences.len(), InfluencerCounts::default);
        }
        if count == 0 {
            return;
        }
        for (field, influence) in self.influencers.iter_mut().zip(influences) {
            if let Some(influence) = influence {
                *field
                    .entry((pid_cid, Arc::clone(influence)))
                    .or_insert(0) += count;
            }
        }
    }

    /// Has `pid_cid` only had explicit null records in this bucket?
    pub fn has_explicit_nulls_only(&self, pid_cid: PidCid) -> bool {
        self.explicit_nulls.contains(&pid_cid) && !self.counts.contains_key(&pid_cid)
    }

    /// Non-zero counts summed over attributes, sorted by person
    pub fn person_non_zero_counts(&self) -> Vec<(PersonId, u64)> {
        let mut by_person: FxHashMap<PersonId, u64> = FxHashMap::default();
        for ((pid, _), count) in &self.counts {
            *by_person.entry(*pid).or_insert(0) += count;
        }
        let mut result: Vec<_> = by_person.into_iter().filter(|(_, c)| *c > 0).collect();
        result.sort_unstable();
        result
    }

    /// Keep only the pairs for which `keep` holds
    pub fn retain<F: Fn(PidCid) -> bool>(&mut self, keep: F) {
        self.counts.retain(|pid_cid, _| keep(*pid_cid));
        self.explicit_nulls.retain(|pid_cid| keep(*pid_cid));
        for field in &mut self.influencers {
            field.retain(|(pid_cid, _), _| keep(*pid_cid));
        }
    }

    fn sorted_counts(&self) -> Vec<(PidCid, u64)> {
        let mut counts: Vec<_> = self.counts.iter().map(|(k, v)| (*k, *v)).collect();
        counts.sort_unstable();
        counts
    }

    pub fn accept_persist_inserter(&self, inserter: &mut StateInserter) {
        inserter.insert_level(Tag::Counts, |inserter| {
            for ((pid, cid), count) in self.sorted_counts() {
                inserter.insert_level(Tag::Entry, |inserter| {
                    inserter.insert_value(Tag::Pid, pid);
                    inserter.insert_value(Tag::Cid, cid);
                    inserter.insert_value(Tag::Value, count);
                });
            }
        });
        inserter.insert_level(Tag::ExplicitNulls, |inserter| {
            let mut nulls: Vec<_> = self.explicit_nulls.iter().copied().collect();
            nulls.sort_unstable();
            for (pid, cid) in nulls {
                inserter.insert_level(Tag::Entry, |inserter| {
                    inserter.insert_value(Tag::Pid, pid);
                    inserter.insert_value(Tag::Cid, cid);
                });
            }
        });
        inserter.insert_level(Tag::Influencers, |inserter| {
            for field in &self.influencers {
                inserter.insert_level(Tag::InfluenceField, |inserter| {
                    let mut entries: Vec<_> = field.iter().collect();
                    entries.sort_unstable();
                    for (((pid, cid), influence), count) in entries {
                        inserter.insert_level(Tag::Entry, |inserter| {
                            inserter.insert_value(Tag::Pid, pid);
                            inserter.insert_value(Tag::Cid, cid);
                            inserter.insert_value(Tag::Influence, influence);
                            inserter.insert_value(Tag::Value, count);
                        });
                    }
                });
            }
        });
    }

    pub fn restore(
        traverser: StateTraverser<'_>,
        strings: &mut StringStore,
    ) -> Result<Self, PersistError> {
        let mut result = BucketAggregates::default();
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::Counts => {
                    for pair in entry.level()? {
                        let fields = PairEntry::restore(pair?.level()?, strings)?;
                        let count = required(fields.value, Tag::Value)?;
                        result.counts.insert(fields.pid_cid()?, count);
                    }
                }
                Tag::ExplicitNulls => {
                    for pair in entry.level()? {
                        let fields = PairEntry::restore(pair?.level()?, strings)?;
                        result.explicit_nulls.insert(fields.pid_cid()?);
                    }
                }
                Tag::Influencers => {
                    for field_entry in entry.level()? {
                        let field_entry = field_entry?;
                        if field_entry.tag != Tag::InfluenceField {
                            return Err(PersistError::UnexpectedTag(field_entry.tag));
                        }
                        let mut field = InfluencerCounts::default();
                        for pair in field_entry.level()? {
                            let fields = PairEntry::restore(pair?.level()?, strings)?;
                            let count = required(fields.value, Tag::Value)?;
                            let influence = required(fields.influence.clone(), Tag::Influence)?;
                            field.insert((fields.pid_cid()?, influence), count);
                        }
                        result.influencers.push(field);
                    }
                }
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        Ok(result)
    }
}

impl Merge for BucketAggregates {
    fn merge(&mut self, other: &BucketAggregates) {
        for (pid_cid, count) in &other.counts {
            self.add_count(*pid_cid, *count);
        }
        self.explicit_nulls.extend(other.explicit_nulls.iter().copied());
        if self.influencers.len() < other.influencers.len() {
            self.influencers
                .resize_with(other.influencers.len(), InfluencerCounts::default);
        }
        for (mine, theirs) in self.influencers.iter_mut().zip(&other.influencers) {
            for (key, count) in theirs {
                *mine.entry(key.clone()).or_insert(0) += count;
            }
        }
    }
}

impl PairData for BucketAggregates {
    fn retain_pairs<F: Fn(PidCid) -> bool>(&mut self, keep: F) {
        self.retain(keep)
    }

    fn is_empty(&self) -> bool {
        BucketAggregates::is_empty(self)
    }
}

/// The fields of one persisted map entry
#[derive(Default)]
struct PairEntry {
    pid: Option<usize>,
    cid: Option<usize>,
    influence: Option<Arc<str>>,
    value: Option<u64>,
}

impl PairEntry {
    fn restore(
        traverser: StateTraverser<'_>,
        strings: &mut StringStore,
    ) -> Result<Self, PersistError> {
        let mut result = PairEntry::default();
        for entry in traverser {
            let entry = entry?;
            match entry.tag {
                Tag::Pid => result.pid = Some(entry.parse()?),
                Tag::Cid => result.cid = Some(entry.parse()?),
                Tag::Influence => result.influence = Some(strings.get(entry.text()?)),
                Tag::Value => result.value = Some(entry.parse()?),
                other => return Err(PersistError::UnexpectedTag(other)),
            }
        }
        Ok(result)
    }

    fn pid_cid(&self) -> Result<PidCid, PersistError> {
        Ok((required(self.pid, Tag::Pid)?, required(self.cid, Tag::Cid)?))
    }
}

fn hash_pid_cid((pid, cid): PidCid) -> u64 {
    checksum::hash_of(&(pid as u64, cid as u64))
}

impl Checksum for BucketAggregates {
    fn checksum(&self) -> u64 {
        let counts = checksum::unordered(
            0,
            self.counts
                .iter()
                .map(|(k, v)| checksum::combine(hash_pid_cid(*k), checksum::hash_of(v))),
        );
        let nulls = checksum::unordered(1, self.explicit_nulls.iter().map(|k| hash_pid_cid(*k)));
        let influencers = checksum::ordered(
            2,
            self.influencers.iter().map(|field| {
                checksum::unordered(
                    3,
                    field.iter().map(|((k, influence), v)| {
                        let key = checksum::combine(
                            hash_pid_cid(*k),
                            checksum::hash_of(influence.as_ref()),
                        );
                        checksum::combine(key, checksum::hash_of(v))
                    }),
                )
            }),
        );
        checksum::ordered(counts, [nulls, influencers])
    }
}

impl MemoryUsage for BucketAggregates {
    fn memory_usage(&self) -> usize {
        map_usage(&self.counts)
            + set_usage(&self.explicit_nulls)
            + self.influencers.capacity() * std::mem::size_of::<InfluencerCounts>()
            + self.influencers.iter().map(map_usage).sum::<usize>()
    }
}
