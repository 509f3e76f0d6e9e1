//! Engine events, the boundary to notification dispatch.
//!
//! RULE: Events are recorded only after the transaction that caused
//! them has committed. A failed dispatch never rolls back matching
//! state.
//! Variants are added over time and never removed or reordered.

use crate::types::{JobId, LockId, ProviderId, TeamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchEvent {
    // ── Lock lifecycle ─────────────────────────────
    LocksCreated {
        job_id: JobId,
        lock_ids: Vec<LockId>,
        units: u32,
    },
    LocksConfirmed {
        job_id: JobId,
        lock_ids: Vec<LockId>,
    },
    LocksReleased {
        job_id: JobId,
        lock_ids: Vec<LockId>,
        reason: String,
    },
    LocksPromoted {
        job_id: JobId,
        lock_ids: Vec<LockId>,
        provider_ids: Vec<ProviderId>,
        team_id: Option<TeamId>,
    },

    // ── Matching outcomes ──────────────────────────
    JobMatched {
        job_id: JobId,
        provider_ids: Vec<ProviderId>,
        team_id: Option<TeamId>,
    },
    MatchRetryFailed {
        job_id: JobId,
        retry_count: u32,
    },
    FallbackRequested {
        job_id: JobId,
        team_candidate: Option<TeamId>,
    },
    JobEscalated {
        job_id: JobId,
        retry_count: u32,
        team_candidate: Option<TeamId>,
    },
}

impl MatchEvent {
    pub fn job_id(&self) -> &str {
        match self {
            MatchEvent::LocksCreated { job_id, .. }
            | MatchEvent::LocksConfirmed { job_id, .. }
            | MatchEvent::LocksReleased { job_id, .. }
            | MatchEvent::LocksPromoted { job_id, .. }
            | MatchEvent::JobMatched { job_id, .. }
            | MatchEvent::MatchRetryFailed { job_id, .. }
            | MatchEvent::FallbackRequested { job_id, .. }
            | MatchEvent::JobEscalated { job_id, .. } => job_id,
        }
    }

    /// Stable name for the event_type column in event_log.
    pub fn type_name(&self) -> &'static str {
        match self {
            MatchEvent::LocksCreated { .. }      => "locks_created",
            MatchEvent::LocksConfirmed { .. }    => "locks_confirmed",
            MatchEvent::LocksReleased { .. }     => "locks_released",
            MatchEvent::LocksPromoted { .. }     => "locks_promoted",
            MatchEvent::JobMatched { .. }        => "job_matched",
            MatchEvent::MatchRetryFailed { .. }  => "match_retry_failed",
            MatchEvent::FallbackRequested { .. } => "fallback_requested",
            MatchEvent::JobEscalated { .. }      => "job_escalated",
        }
    }

    /// Operator-facing events go to the ops queue; the rest to the
    /// providers involved.
    pub fn is_operator_facing(&self) -> bool {
        matches!(
            self,
            MatchEvent::FallbackRequested { .. } | MatchEvent::JobEscalated { .. }
        )
    }
}

/// A persisted event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id:         Option<i64>,
    pub job_id:     Option<JobId>,
    pub event_type: String,
    pub payload:    String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_tagged() {
        let event = MatchEvent::MatchRetryFailed { job_id: "job-1".into(), retry_count: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "match_retry_failed");
        assert_eq!(event.type_name(), "match_retry_failed");
    }
}
