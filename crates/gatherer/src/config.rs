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

//! Configuration of a gatherer and its validation.

use crate::time::Time;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;
use strum_macros::{Display, EnumString};

const BUCKET_LENGTH_DEFAULT: Duration = Duration::from_secs(300);

const SAMPLE_COUNT_WEIGHT_DEFAULT: f64 = 0.1;

pub(crate) const fn default_bucket_length() -> Duration {
    BUCKET_LENGTH_DEFAULT
}

pub(crate) const fn default_sample_count_weight() -> f64 {
    SAMPLE_COUNT_WEIGHT_DEFAULT
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    InvalidBucketLength,
    InvalidMultiBucketLength(Duration),
    InvalidSampleCountWeight(f64),
    FeatureNotSupported {
        feature: Feature,
        kind: EntitySeriesKind,
    },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBucketLength => {
                write!(f, "bucket_length must be a positive whole number of seconds")
            }
            Self::InvalidMultiBucketLength(length) => write!(
                f,
                "multi bucket length {}s must be a multiple of, and longer than, bucket_length",
                length.as_secs_f64()
            ),
            Self::InvalidSampleCountWeight(weight) => {
                write!(f, "sample_count_weight {weight} must be in (0, 1]")
            }
            Self::FeatureNotSupported { feature, kind } => {
                write!(f, "feature \"{feature}\" is not supported by \"{kind}\" series")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// The kind of data series a gatherer collects
#[derive(
    Display, EnumString, Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntitySeriesKind {
    EventRate,
    Metric,
}

impl EntitySeriesKind {
    pub fn default_features(&self) -> &'static [Feature] {
        match self {
            Self::EventRate => &[Feature::CountByBucketAndPerson],
            Self::Metric => &[Feature::MeanByPerson],
        }
    }
}

/// The bucket statistics a gatherer can extract
#[derive(
    Display,
    EnumString,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Feature {
    /// Sum of the counts of every attribute of a person
    CountByBucketAndPerson,
    /// One for every person with a non zero count
    NonZeroCountByBucketAndPerson,
    /// Number of distinct string values seen for a person
    UniqueCountByBucketAndPerson,
    /// Count of every (person, attribute) pair
    CountByBucketPersonAndAttribute,
    MeanByPerson,
    MinByPerson,
    MaxByPerson,
    SumByBucketAndPerson,
}

impl Feature {
    pub fn kind(&self) -> EntitySeriesKind {
        match self {
            Self::CountByBucketAndPerson
            | Self::NonZeroCountByBucketAndPerson
            | Self::UniqueCountByBucketAndPerson
            | Self::CountByBucketPersonAndAttribute => EntitySeriesKind::EventRate,
            Self::MeanByPerson
            | Self::MinByPerson
            | Self::MaxByPerson
            | Self::SumByBucketAndPerson => EntitySeriesKind::Metric,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GathererConfig {
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_bucket_length")]
    pub bucket_length: Duration,

    /// Number of buckets before the current one still accepting late records
    #[serde(default)]
    pub latency_buckets: usize,

    #[serde_as(as = "Vec<serde_with::DurationSeconds<u64>>")]
    #[serde(default)]
    pub multi_bucket_lengths: Vec<Duration>,

    /// Features to extract, the series kind's defaults when empty
    #[serde(default)]
    pub features: Vec<Feature>,

    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub max_people: Option<usize>,

    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub max_attributes: Option<usize>,

    #[serde(default = "default_sample_count_weight")]
    pub sample_count_weight: f64,
}

impl Default for GathererConfig {
    fn default() -> Self {
        Self {
            bucket_length: default_bucket_length(),
            latency_buckets: 0,
            multi_bucket_lengths: Vec::new(),
            features: Vec::new(),
            max_people: None,
            max_attributes: None,
            sample_count_weight: default_sample_count_weight(),
        }
    }
}

impl GathererConfig {
    pub fn bucket_length_secs(&self) -> Time {
        self.bucket_length.as_secs() as Time
    }

    pub fn multi_bucket_lengths_secs(&self) -> Vec<Time> {
        self.multi_bucket_lengths
            .iter()
            .map(|length| length.as_secs() as Time)
            .collect()
    }

    /// The features to extract for a series of `kind`
    pub fn features_for(&self, kind: EntitySeriesKind) -> Vec<Feature> {
        if self.features.is_empty() {
            kind.default_features().to_vec()
        } else {
            let mut features = self.features.clone();
            features.sort_unstable();
            features.dedup();
            features
        }
    }

    pub fn validate(&self, kind: EntitySeriesKind) -> Result<(), ConfigurationError> {
        if self.bucket_length.is_zero() || self.bucket_length.subsec_nanos() != 0 {
            return Err(ConfigurationError::InvalidBucketLength);
        }
        let bucket_length = self.bucket_length.as_secs();
        for length in &self.multi_bucket_lengths {
            if length.subsec_nanos() != 0
                || length.as_secs() <= bucket_length
                || length.as_secs() % bucket_length != 0
            {
                return Err(ConfigurationError::InvalidMultiBucketLength(*length));
            }
        }
        if !(self.sample_count_weight > 0.0 && self.sample_count_weight <= 1.0) {
            return Err(ConfigurationError::InvalidSampleCountWeight(
                self.sample_count_weight,
            ));
        }
        if let Some(feature) = self.features.iter().find(|f| f.kind() != kind) {
            return Err(ConfigurationError::FeatureNotSupported {
                feature: *feature,
                kind,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn test_default_is_valid() {
        let config = GathererConfig::default();
        assert_eq!(config.validate(EntitySeriesKind::EventRate), Ok(()));
        assert_eq!(config.validate(EntitySeriesKind::Metric), Ok(()));
        assert_eq!(config.bucket_length_secs(), 300);
    }

    #[rstest]
    #[case(Duration::from_secs(0))]
    #[case(Duration::from_millis(1500))]
    fn test_invalid_bucket_length(#[case] bucket_length: Duration) {
        let config = GathererConfig {
            bucket_length,
            ..Default::default()
        };
        assert_eq!(
            config.validate(EntitySeriesKind::EventRate),
            Err(ConfigurationError::InvalidBucketLength)
        );
    }

    #[rstest]
    #[case(60, Ok(()))]
    #[case(30, Err(ConfigurationError::InvalidMultiBucketLength(Duration::from_secs(30))))]
    #[case(60 * 5 + 1, Err(ConfigurationError::InvalidMultiBucketLength(Duration::from_secs(60 * 5 + 1))))]
    #[case(60 * 5, Ok(()))]
    fn test_multi_bucket_lengths(
        #[case] secs: u64,
        #[case] expected: Result<(), ConfigurationError>,
    ) {
        let multi = if secs == 60 {
            vec![]
        } else {
            vec![Duration::from_secs(secs)]
        };
        let config = GathererConfig {
            bucket_length: Duration::from_secs(60),
            multi_bucket_lengths: multi,
            ..Default::default()
        };
        assert_eq!(config.validate(EntitySeriesKind::EventRate), expected);
    }

    #[test]
    fn test_feature_kind_checked() {
        let config = GathererConfig {
            features: vec![Feature::CountByBucketAndPerson, Feature::MeanByPerson],
            ..Default::default()
        };
        assert_eq!(
            config.validate(EntitySeriesKind::EventRate),
            Err(ConfigurationError::FeatureNotSupported {
                feature: Feature::MeanByPerson,
                kind: EntitySeriesKind::EventRate,
            })
        );
    }

    #[test]
    fn test_deserialize() {
        let json = r#"{
            "bucket_length": 60,
            "latency_buckets": 2,
            "multi_bucket_lengths": [300],
            "features": ["count_by_bucket_and_person", "unique_count_by_bucket_and_person"]
        }"#;
        let config: GathererConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.bucket_length_secs(), 60);
        assert_eq!(config.latency_buckets, 2);
        assert_eq!(config.multi_bucket_lengths_secs(), vec![300]);
        assert_eq!(config.sample_count_weight, 0.1);
        assert_eq!(
            Feature::from_str("min_by_person"),
            Ok(Feature::MinByPerson)
        );
        assert_eq!(
            config.features_for(EntitySeriesKind::EventRate),
            vec![
                Feature::CountByBucketAndPerson,
                Feature::UniqueCountByBucketAndPerson
            ]
        );
    }
}
