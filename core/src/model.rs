//! Domain records shared by the store and the matching components.
//!
//! These are plain data: no SQL, no policy. Status enums persist as
//! snake_case text through the `db_enum!` impls below.

use crate::types::{ClientId, JobId, LockId, ProviderId, SlotId, TeamId, TimeWindow};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! db_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(text: &str) -> Option<Self> {
                match text {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                $name::parse(text).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{text}'", stringify!($name)).into())
                })
            }
        }
    };
}

// ── Providers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Individual,
    Company,
}

db_enum!(ProviderKind { Individual => "individual", Company => "company" });

/// Recurring weekly window. `weekday` is 0 = Sunday … 6 = Saturday,
/// minutes are minute-of-day in `timezone`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub weekday:      u8,
    pub start_minute: u16,
    pub end_minute:   u16,
    pub timezone:     String,
    pub active:       bool,
}

impl AvailabilitySlot {
    pub fn minutes(&self) -> i64 {
        (self.end_minute as i64 - self.start_minute as i64).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOffPeriod {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id:             ProviderId,
    pub display_name:   String,
    pub kind:           ProviderKind,
    pub active:         bool,
    pub eco_friendly:   bool,
    pub hourly_rate:    f64,
    pub rating_average: f64,
    pub rating_count:   u32,
    pub services:       Vec<String>,
    pub service_zones:  Vec<String>,
    pub areas:          Vec<String>,
    pub slots:          Vec<AvailabilitySlot>,
    pub time_off:       Vec<TimeOffPeriod>,
}

// ── Teams ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub provider_id: ProviderId,
    pub is_lead:     bool,
    pub order_index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id:                 TeamId,
    pub name:               String,
    pub timezone:           String,
    pub daily_capacity_cap: Option<u32>,
    pub active:             bool,
    /// Empty means the team takes any service.
    pub services:           Vec<String>,
    pub members:            Vec<TeamMember>,
}

impl Team {
    pub fn offers(&self, service: &str) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| s == service)
    }
}

// ── Jobs and assignments ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    PendingProvider,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

db_enum!(JobStatus {
    PendingProvider => "pending_provider",
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    Auto,
    Manual,
}

db_enum!(AssignmentMode { Auto => "auto", Manual => "manual" });

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id:                      JobId,
    pub client_id:               ClientId,
    pub service:                 String,
    pub eco_preference:          bool,
    pub city:                    Option<String>,
    pub postal_code:             Option<String>,
    pub start_at:                DateTime<Utc>,
    pub end_at:                  DateTime<Utc>,
    pub required_members:        u32,
    pub surface_m2:              Option<f64>,
    pub status:                  JobStatus,
    pub assignment_mode:         AssignmentMode,
    pub matching_retry_count:    u32,
    pub fallback_team_candidate: Option<TeamId>,
    pub fallback_requested_at:   Option<DateTime<Utc>>,
    pub fallback_escalated_at:   Option<DateTime<Utc>>,
    pub created_at:              DateTime<Utc>,
    pub updated_at:              DateTime<Utc>,
}

impl Job {
    pub fn window(&self) -> TimeWindow {
        TimeWindow { start: self.start_at, end: self.end_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Proposed,
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

db_enum!(AssignmentStatus {
    Proposed => "proposed",
    Scheduled => "scheduled",
    Confirmed => "confirmed",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl AssignmentStatus {
    /// Statuses that occupy the provider's calendar.
    pub const BLOCKING: [AssignmentStatus; 4] = [
        AssignmentStatus::Proposed,
        AssignmentStatus::Scheduled,
        AssignmentStatus::Confirmed,
        AssignmentStatus::InProgress,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id:          String,
    pub job_id:      JobId,
    pub provider_id: ProviderId,
    pub team_id:     Option<TeamId>,
    pub start_at:    DateTime<Utc>,
    pub end_at:      DateTime<Utc>,
    pub status:      AssignmentStatus,
    pub created_at:  DateTime<Utc>,
}

// ── Capacity ─────────────────────────────────────────────────────────────────

/// One row per (team, calendar day in team timezone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub id:              String,
    pub team_id:         TeamId,
    pub day:             NaiveDate,
    pub capacity_slots:  u32,
    pub capacity_booked: u32,
}

/// One row per (team, exact requested window).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacitySlot {
    pub id:       SlotId,
    pub team_id:  TeamId,
    pub plan_id:  String,
    pub start_at: DateTime<Utc>,
    pub end_at:   DateTime<Utc>,
    pub capacity: u32,
    pub booked:   u32,
}

impl CapacitySlot {
    /// Remaining unreserved capacity; negative when capacity shrank under bookings.
    pub fn headroom(&self) -> i64 {
        self.capacity as i64 - self.booked as i64
    }
}

// ── Locks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Held,
    Confirmed,
    Released,
}

db_enum!(LockStatus { Held => "held", Confirmed => "confirmed", Released => "released" });

impl LockStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, LockStatus::Held | LockStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Manual,
    Expired,
    Promoted,
}

db_enum!(ReleaseReason { Manual => "manual", Expired => "expired", Promoted => "promoted" });

/// What a lock reserves capacity against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockTarget {
    Team { team_id: TeamId, slot_id: SlotId },
    Provider { provider_id: ProviderId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub id:             LockId,
    pub job_id:         JobId,
    pub target:         LockTarget,
    pub locked_count:   u32,
    pub status:         LockStatus,
    pub release_reason: Option<ReleaseReason>,
    pub expires_at:     DateTime<Utc>,
    pub created_at:     DateTime<Utc>,
    pub updated_at:     DateTime<Utc>,
}
