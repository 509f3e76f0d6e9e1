//! Shared primitive types used across the matching engine.

use crate::error::{MatchError, MatchResult};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type ProviderId = String;
pub type TeamId = String;
pub type JobId = String;
pub type LockId = String;
pub type SlotId = String;
pub type ClientId = String;

/// Smallest and largest headcount a single job may request.
pub const MIN_HEADCOUNT: u32 = 1;
pub const MAX_HEADCOUNT: u32 = 20;

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> MatchResult<Self> {
        if end <= start {
            return Err(MatchError::validation(format!(
                "time window end {end} must be after start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration().num_minutes()
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration().num_seconds() as f64 / 3600.0
    }

    /// Overlap test used everywhere: `a.start < b.end && a.end > b.start`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && self.end > start
    }
}

pub fn validate_headcount(required: u32) -> MatchResult<()> {
    if !(MIN_HEADCOUNT..=MAX_HEADCOUNT).contains(&required) {
        return Err(MatchError::validation(format!(
            "headcount {required} outside [{MIN_HEADCOUNT}, {MAX_HEADCOUNT}]"
        )));
    }
    Ok(())
}

/// Timestamps are persisted as unix seconds.
pub fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
