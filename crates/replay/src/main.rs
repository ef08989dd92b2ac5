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


use anyhow::Context;
use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use sieve_gatherer::{persist::TaggedStream, BucketGatherer, Checksum, MemoryUsage};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{info, warn, Level};

mod config;
mod replay;

use crate::{
    config::ReplayConfig,
    replay::{Record, Replayer},
};

/// Replay recorded events through a bucket gatherer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file, values can be overridden by `SIEVE_` prefixed
    /// environment variables
    config_file: PathBuf,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::from_str(level).context("invalid logging level")?)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config: ReplayConfig = Figment::new()
        .merge(Yaml::file(&args.config_file))
        .merge(Env::prefixed("SIEVE_").split("__"))
        .extract()
        .with_context(|| format!("parsing config file {} failed", args.config_file.display()))?;
    init_tracing(&config.logging.level)?;

    let input = File::open(&config.input)
        .with_context(|| format!("opening input {} failed", config.input.display()))?;
    let output: Box<dyn Write> = match &config.output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("creating output {} failed", path.display())
        })?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut replayer = Replayer::new(config.kind, config.gatherer.clone(), output)?;
    for (index, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping malformed record");
                continue;
            }
        };
        replayer
            .replay(&record)
            .with_context(|| format!("replaying line {} failed", index + 1))?;
    }
    let (gatherer, _) = replayer.finish()?;

    if let (Some(gatherer), Some(path)) = (gatherer, &config.snapshot) {
        write_snapshot(&gatherer, &config, path)?;
    }
    Ok(())
}

/// Write the final state to `path` and check that it restores to the same
/// state
fn write_snapshot(
    gatherer: &BucketGatherer,
    config: &ReplayConfig,
    path: &Path,
) -> anyhow::Result<()> {
    let snapshot = gatherer.clone_for_snapshot();
    let file = File::create(path)
        .with_context(|| format!("creating snapshot {} failed", path.display()))?;
    let mut writer = BufWriter::new(file);
    snapshot.persist().to_json_writer(&mut writer)?;
    writer.flush()?;

    let stream = TaggedStream::from_json_reader(BufReader::new(File::open(path)?))?;
    let restored = BucketGatherer::restore(config.kind, config.gatherer.clone(), &stream)
        .with_context(|| format!("restoring snapshot {} failed", path.display()))?;
    anyhow::ensure!(
        restored.checksum() == snapshot.checksum(),
        "snapshot {} does not restore to the persisted state",
        path.display()
    );
    info!(
        path = %path.display(),
        checksum = snapshot.checksum(),
        memory_usage = gatherer.memory_usage(),
        "snapshot written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_gatherer::{EntitySeriesKind, GathererConfig};
    use std::time::Duration;

    #[test]
    fn test_write_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplayConfig {
            logging: Default::default(),
            kind: EntitySeriesKind::EventRate,
            gatherer: GathererConfig {
                bucket_length: Duration::from_secs(60),
                latency_buckets: 1,
                ..Default::default()
            },
            input: dir.path().join("events.jsonl"),
            output: None,
            snapshot: Some(dir.path().join("snapshot.json")),
        };
        let mut replayer =
            Replayer::new(config.kind, config.gatherer.clone(), io::sink()).unwrap();
        for time in [0, 30, 90] {
            let record: Record = serde_json::from_str(&format!(
                r#"{{"time": {time}, "person": "alice", "attribute": "login"}}"#
            ))
            .unwrap();
            replayer.replay(&record).unwrap();
        }
        let (gatherer, _) = replayer.finish().unwrap();
        let path = config.snapshot.clone().unwrap();
        write_snapshot(&gatherer.unwrap(), &config, &path).unwrap();
        assert!(path.exists());
    }
}
