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

//! Bucket arithmetic over integral event time.
//!
//! Event time is expressed in whole seconds since the Unix epoch. Buckets are
//! aligned to multiples of the bucket length, so the same record always lands
//! in the same bucket regardless of when the gatherer was started.

use chrono::{DateTime, Utc};

/// Seconds since the Unix epoch
pub type Time = i64;

/// Return the start of the bucket of length `bucket_length` containing `time`.
///
/// Works for negative times as well, i.e., `bucket_start(-1, 60) == -60`.
#[inline]
pub fn bucket_start(time: Time, bucket_length: Time) -> Time {
    time - time.rem_euclid(bucket_length)
}

/// Return the (noninclusive) end of the bucket containing `time`
#[inline]
pub fn bucket_end(time: Time, bucket_length: Time) -> Time {
    bucket_start(time, bucket_length) + bucket_length
}

/// Render a time for logs and debug dumps
pub fn display_time(time: Time) -> String {
    match DateTime::<Utc>::from_timestamp(time, 0) {
        Some(ts) => ts.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        None => time.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 60, 0)]
    #[case(5, 60, 0)]
    #[case(59, 60, 0)]
    #[case(60, 60, 60)]
    #[case(65, 60, 60)]
    #[case(-1, 60, -60)]
    #[case(-60, 60, -60)]
    #[case(-61, 60, -120)]
    #[case(1199, 600, 600)]
    fn test_bucket_start(#[case] time: Time, #[case] length: Time, #[case] expected: Time) {
        assert_eq!(bucket_start(time, length), expected);
        assert_eq!(bucket_end(time, length), expected + length);
    }

    #[test]
    fn test_display_time() {
        assert_eq!(display_time(0), "1970-01-01T00:00:00Z");
        assert_eq!(display_time(3600), "1970-01-01T01:00:00Z");
    }
}
