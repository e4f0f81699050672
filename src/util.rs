// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Crate-private utilities.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};

/// Renders a timestamp in RFC 3339 format with nanosecond precision
/// in UTC, e.g. `2023-06-01T12:34:56.789012345Z`. This is the
/// timestamp format of both the application log and the query log.
pub fn rfc3339_nano(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Renders a timestamp suitable for embedding in a file name:
/// RFC 3339 with nanosecond precision, which contains no spaces.
pub fn filename_timestamp(time: SystemTime) -> String {
    rfc3339_nano(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rfc3339_nano_renders_utc_with_nanoseconds() {
        let time = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        assert_eq!(rfc3339_nano(time), "2023-11-14T22:13:20.123456789Z");
    }
}
