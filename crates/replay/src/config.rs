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


use serde::{Deserialize, Serialize};
use sieve_gatherer::{EntitySeriesKind, GathererConfig};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Kind of series to gather alongside the bucket aggregates
    pub kind: EntitySeriesKind,

    #[serde(default)]
    pub gatherer: GathererConfig,

    /// JSON lines file of records, sorted by time apart from late arrivals
    pub input: PathBuf,

    /// Where to write the extracted features, stdout when absent
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub output: Option<PathBuf>,

    /// Where to write the final gatherer state
    #[serde(default, skip_serializing_if = "::std::option::Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_gatherer::Feature;
    use std::time::Duration;

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
logging:
  level: debug
kind: metric
gatherer:
  bucket_length: 300
  latency_buckets: 2
  multi_bucket_lengths: [900, 3600]
  features: [mean_by_person, max_by_person]
input: events.jsonl
snapshot: state.json
"#;
        let config: ReplayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.kind, EntitySeriesKind::Metric);
        assert_eq!(config.gatherer.bucket_length, Duration::from_secs(300));
        assert_eq!(config.gatherer.latency_buckets, 2);
        assert_eq!(
            config.gatherer.multi_bucket_lengths,
            vec![Duration::from_secs(900), Duration::from_secs(3600)]
        );
        assert_eq!(
            config.gatherer.features,
            vec![Feature::MeanByPerson, Feature::MaxByPerson]
        );
        assert_eq!(config.input, PathBuf::from("events.jsonl"));
        assert_eq!(config.output, None);
        assert_eq!(config.snapshot, Some(PathBuf::from("state.json")));
    }

    #[test]
    fn test_defaults() {
        let yaml = r#"
kind: event_rate
input: events.jsonl
"#;
        let config: ReplayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.gatherer, GathererConfig::default());
    }
}
