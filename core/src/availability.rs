//! Availability Resolver.
//!
//! Turns recurring weekly slots plus absolute time-off into a coverage
//! verdict for a concrete window. Each slot is evaluated in its own
//! timezone; time-off vetoes everything it overlaps.

use crate::{
    model::{AvailabilitySlot, TimeOffPeriod},
    types::TimeWindow,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Coarse match quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityTier {
    Unavailable,
    Buffer,
    Exact,
}

impl AvailabilityTier {
    pub fn value(&self) -> f64 {
        match self {
            AvailabilityTier::Exact       => 1.0,
            AvailabilityTier::Buffer      => 0.7,
            AvailabilityTier::Unavailable => 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        *self != AvailabilityTier::Unavailable
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coverage {
    pub tier: AvailabilityTier,
    /// Job minutes ÷ weekly available minutes. Ordering hint only;
    /// infinite when the provider has no active weekly time at all.
    pub load: f64,
}

impl Coverage {
    pub const NONE: Coverage = Coverage { tier: AvailabilityTier::Unavailable, load: f64::INFINITY };
}

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

/// Window localized to a timezone: weekday (0 = Sunday) of the start,
/// start minute-of-day, and end expressed in minutes from the same
/// local midnight (so an end at the following midnight is 1440).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalSpan {
    weekday:   u8,
    start_min: i64,
    end_min:   i64,
}

fn local_span(window: &TimeWindow, tz: Tz) -> LocalSpan {
    let start = window.start.with_timezone(&tz);
    let end = window.end.with_timezone(&tz);
    let midnight = start.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    LocalSpan {
        weekday: start.weekday().num_days_from_sunday() as u8,
        start_min: (start.hour() * 60 + start.minute()) as i64,
        end_min: (end.naive_local() - midnight).num_minutes(),
    }
}

fn slot_tier(slot: &AvailabilitySlot, window: &TimeWindow, buffer_minutes: i64) -> AvailabilityTier {
    if !slot.active || slot.minutes() == 0 {
        return AvailabilityTier::Unavailable;
    }
    let Some(tz) = parse_timezone(&slot.timezone) else {
        log::warn!("availability: unknown timezone '{}' on slot, ignoring", slot.timezone);
        return AvailabilityTier::Unavailable;
    };
    let span = local_span(window, tz);
    // Both ends must fall on the slot's day.
    if span.weekday != slot.weekday || span.end_min > MINUTES_PER_DAY {
        return AvailabilityTier::Unavailable;
    }
    let (slot_start, slot_end) = (slot.start_minute as i64, slot.end_minute as i64);
    if span.start_min >= slot_start && span.end_min <= slot_end {
        return AvailabilityTier::Exact;
    }
    let overlaps = span.start_min < slot_end && span.end_min > slot_start;
    if buffer_minutes > 0
        && overlaps
        && span.start_min >= slot_start - buffer_minutes
        && span.end_min <= slot_end + buffer_minutes
    {
        return AvailabilityTier::Buffer;
    }
    AvailabilityTier::Unavailable
}

pub fn time_off_overlaps(time_off: &[TimeOffPeriod], window: &TimeWindow) -> bool {
    time_off.iter().any(|t| window.overlaps(t.start, t.end))
}

/// Sum of active weekly slot minutes.
pub fn weekly_minutes(slots: &[AvailabilitySlot]) -> i64 {
    slots.iter().filter(|s| s.active).map(AvailabilitySlot::minutes).sum()
}

/// Best tier across all slots, vetoed by any overlapping time-off.
pub fn resolve(
    slots: &[AvailabilitySlot],
    time_off: &[TimeOffPeriod],
    window: &TimeWindow,
    buffer_minutes: i64,
) -> Coverage {
    if time_off_overlaps(time_off, window) {
        return Coverage::NONE;
    }
    let tier = slots
        .iter()
        .map(|slot| slot_tier(slot, window, buffer_minutes))
        .max()
        .unwrap_or(AvailabilityTier::Unavailable);
    let weekly = weekly_minutes(slots);
    let load = if weekly > 0 {
        window.duration_minutes() as f64 / weekly as f64
    } else {
        f64::INFINITY
    };
    Coverage { tier, load }
}

/// Exact coverage only, no buffer. Used by the capacity ledger.
pub fn covers_exactly(slots: &[AvailabilitySlot], time_off: &[TimeOffPeriod], window: &TimeWindow) -> bool {
    resolve(slots, time_off, window, 0).tier == AvailabilityTier::Exact
}

fn local_instant(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        // Inside a DST gap: the wall time does not exist, step past it.
        None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// Is there an active slot on `day` (in `tz`) that no time-off touches?
pub fn available_on_day(
    slots: &[AvailabilitySlot],
    time_off: &[TimeOffPeriod],
    day: NaiveDate,
    tz: Tz,
) -> bool {
    let weekday = day.weekday().num_days_from_sunday() as u8;
    let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    slots
        .iter()
        .filter(|s| s.active && s.weekday == weekday && s.minutes() > 0)
        .any(|s| {
            let start = local_instant(tz, midnight + Duration::minutes(s.start_minute as i64));
            let end = local_instant(tz, midnight + Duration::minutes(s.end_minute as i64));
            !time_off.iter().any(|t| t.start < end && t.end > start)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(weekday: u8, start: u16, end: u16, tz: &str) -> AvailabilitySlot {
        AvailabilitySlot {
            weekday,
            start_minute: start,
            end_minute: end,
            timezone: tz.into(),
            active: true,
        }
    }

    fn window(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeWindow {
        // 2026-03-02 is a Monday.
        TimeWindow {
            start: Utc.with_ymd_and_hms(2026, 3, 2, h1, m1, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 2, h2, m2, 0).unwrap(),
        }
    }

    #[test]
    fn tiers_order_by_quality() {
        assert!(AvailabilityTier::Exact > AvailabilityTier::Buffer);
        assert!(AvailabilityTier::Buffer > AvailabilityTier::Unavailable);
    }

    #[test]
    fn local_span_crosses_midnight() {
        let w = TimeWindow {
            start: Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 3, 1, 0, 0).unwrap(),
        };
        let span = local_span(&w, Tz::UTC);
        assert_eq!(span.start_min, 22 * 60);
        assert_eq!(span.end_min, 25 * 60);
    }

    #[test]
    fn in_slot_is_exact_and_edge_is_buffer() {
        let slots = [slot(1, 8 * 60, 12 * 60, "UTC")];
        assert_eq!(resolve(&slots, &[], &window(9, 0, 11, 0), 60).tier, AvailabilityTier::Exact);
        assert_eq!(resolve(&slots, &[], &window(11, 0, 12, 45), 60).tier, AvailabilityTier::Buffer);
        assert_eq!(resolve(&slots, &[], &window(11, 0, 13, 30), 60).tier, AvailabilityTier::Unavailable);
        assert_eq!(resolve(&slots, &[], &window(11, 0, 12, 45), 0).tier, AvailabilityTier::Unavailable);
    }
}
