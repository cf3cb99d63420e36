//! Shared timestamp format
//!
//! Every timestamp that crosses a component boundary (persisted state, the
//! snapshot invocation, report names, log filtering) uses local wall-clock
//! time in `YYYY-MM-DD HH:MM:SS` with no offset.

use crate::error::{Result, WatchError};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Interchange format
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format used in report directory names
pub const DIR_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
        .map_err(|_| WatchError::Timestamp(s.to_string()))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Current local time at whole-second resolution
pub fn now_local() -> NaiveDateTime {
    truncate_to_seconds(Local::now().naive_local())
}

/// Convert a filesystem time to local wall-clock time, floored to whole
/// seconds so it compares on the same resolution as interval bounds.
///
/// Returns `None` for times outside years 1..=9999; file timestamps are set by
/// whoever owns the file and can be arbitrary.
pub fn system_time_to_local(t: SystemTime) -> Option<NaiveDateTime> {
    let secs = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).ok()?,
        Err(e) => {
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).ok()?;
            if d.subsec_nanos() > 0 {
                -secs - 1
            } else {
                -secs
            }
        }
    };
    let utc = DateTime::<Utc>::from_timestamp(secs, 0)?;
    if !(1..=9999).contains(&utc.year()) {
        return None;
    }
    Some(utc.with_timezone(&Local).naive_local())
}

pub fn truncate_to_seconds(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Serde adapter for `NaiveDateTime` fields stored in the interchange format.
pub mod serde_ts {
    use super::{format_timestamp, TIMESTAMP_FORMAT};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
