//! Outage lifecycle
//!
//! Two states per site: healthy (no record) and down (record holding the
//! time of the first failing probe). `transition` is the whole state machine;
//! persistence lives in `state_store`.

use crate::error::{Result, WatchError};
use crate::timefmt::{format_timestamp, serde_ts};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub success: bool,
    pub code: Option<u16>,
    pub error: Option<String>,
}

impl StatusOutcome {
    /// Classify an HTTP status. Only [200, 400) counts as up.
    pub fn from_status(code: u16) -> Self {
        let success = (200..400).contains(&code);
        Self {
            success,
            code: Some(code),
            error: if success {
                None
            } else {
                Some(format!("HTTP {}", code))
            },
        }
    }

    pub fn transport_failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            code: None,
            error: Some(reason.into()),
        }
    }

    pub fn describe(&self) -> String {
        match (&self.code, &self.error) {
            (Some(code), _) if self.success => format!("HTTP {}", code),
            (_, Some(err)) => err.clone(),
            (Some(code), None) => format!("HTTP {}", code),
            (None, None) => "no response".to_string(),
        }
    }
}

/// Persisted record of an active outage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutageState {
    pub site: String,
    #[serde(with = "serde_ts")]
    pub started_at: NaiveDateTime,
}

/// A resolved outage, handed to the snapshot engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutageInterval {
    pub site: String,
    #[serde(with = "serde_ts")]
    pub started_at: NaiveDateTime,
    #[serde(with = "serde_ts")]
    pub ended_at: NaiveDateTime,
}

impl OutageInterval {
    /// Build an interval, rejecting `start >= end`
    pub fn new(site: &str, started_at: NaiveDateTime, ended_at: NaiveDateTime) -> Result<Self> {
        if started_at >= ended_at {
            return Err(WatchError::Interval {
                start: format_timestamp(&started_at),
                end: format_timestamp(&ended_at),
            });
        }
        Ok(Self {
            site: site.to_string(),
            started_at,
            ended_at,
        })
    }

    /// Inclusive on both ends
    pub fn contains(&self, ts: &NaiveDateTime) -> bool {
        self.started_at <= *ts && *ts <= self.ended_at
    }

    pub fn duration(&self) -> Duration {
        self.ended_at - self.started_at
    }
}

/// What a probe did to a site's outage state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to persist
    Unchanged,
    /// Healthy -> down; persist this record
    Opened(OutageState),
    /// Down -> healthy; delete the record and emit this interval
    Resolved(OutageInterval),
}

/// Apply one probe outcome to the current state.
///
/// If the clock did not move past `started_at` (same second, or skew), the
/// end is placed one second after the start so the interval stays non-empty.
pub fn transition(
    site: &str,
    current: Option<&OutageState>,
    outcome: &StatusOutcome,
    now: NaiveDateTime,
) -> Transition {
    match (current, outcome.success) {
        (None, true) => Transition::Unchanged,
        (None, false) => Transition::Opened(OutageState {
            site: site.to_string(),
            started_at: now,
        }),
        (Some(_), false) => Transition::Unchanged,
        (Some(state), true) => {
            let ended_at = if now > state.started_at {
                now
            } else {
                state.started_at + Duration::seconds(1)
            };
            Transition::Resolved(OutageInterval {
                site: site.to_string(),
                started_at: state.started_at,
                ended_at,
            })
        }
    }
}
