//! Date-and-time representation that can be nicely
//! serialized/deserialized

use std::{fmt::Display, str::FromStr, time::SystemTime};

use chrono::{DateTime, FixedOffset, Local};

/// Stored in RFC 3339 format, with local time zone offset -- CAREFUL,
/// if specified as the wrong string in a file, no check is done on
/// deserialization!
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, serde::Serialize, serde::Deserialize)]
pub struct DateTimeWithOffset(String);

pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let t: DateTime<Local> = DateTime::from(t);
    t.to_rfc3339()
}

impl DateTimeWithOffset {
    pub fn now() -> Self {
        Self(system_time_to_rfc3339(SystemTime::now()))
    }

    pub fn to_datetime(&self) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(&self.0)
            .expect("field is result of to_rfc3339 hence always parseable")
    }

    pub fn to_systemtime(&self) -> SystemTime {
        let dt = self.to_datetime();
        dt.into()
    }

    /// Seconds from `self` to `other`; negative when `other` is
    /// earlier.
    pub fn seconds_until(&self, other: &DateTimeWithOffset) -> f64 {
        let from = self.to_datetime();
        let to = other.to_datetime();
        (to - from).num_milliseconds() as f64 / 1000.
    }

    /// Age relative to the current wall clock, in hours.
    pub fn age_hours(&self) -> f64 {
        let now = Local::now().fixed_offset();
        (now - self.to_datetime()).num_milliseconds() as f64 / 3600_000.
    }
}

impl Display for DateTimeWithOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DateTimeWithOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Parse and format back; needed for error checking and
        // uniform storage.
        let t = DateTime::parse_from_rfc3339(s)?;
        Ok(Self(t.to_rfc3339()))
    }
}
