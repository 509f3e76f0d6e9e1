//! Lock Manager.
//!
//! State machine: HELD → CONFIRMED → RELEASED, with HELD/CONFIRMED also
//! ending in RELEASED on expiry or promotion.
//!
//! RULE: every lock write and its capacity increment/decrement happen in
//!       the same `atomic()` unit, against slot rows re-read inside it.
//! RULE: sum(locked_count of live locks on a slot) ≤ slot.capacity.

use crate::{
    access::Actor,
    capacity,
    config::LockConfig,
    error::{ConflictKind, MatchError, MatchResult},
    model::{Assignment, AssignmentStatus, JobStatus, LockRecord, LockStatus, LockTarget, ReleaseReason},
    store::{require, MatchStore},
    team::member_order,
    types::{new_id, validate_headcount, JobId, LockId, ProviderId, TeamId},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockTargetRequest {
    /// `units` defaults to the job's headcount and is clamped to headroom.
    Team { team_id: TeamId, units: Option<u32> },
    Providers { provider_ids: Vec<ProviderId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub target:      LockTargetRequest,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

impl LockRequest {
    pub fn team(team_id: impl Into<TeamId>, units: Option<u32>) -> Self {
        Self {
            target: LockTargetRequest::Team { team_id: team_id.into(), units },
            ttl_minutes: None,
        }
    }

    pub fn providers(ids: &[&str]) -> Self {
        Self {
            target: LockTargetRequest::Providers {
                provider_ids: ids.iter().map(|s| s.to_string()).collect(),
            },
            ttl_minutes: None,
        }
    }

    pub fn with_ttl(mut self, minutes: i64) -> Self {
        self.ttl_minutes = Some(minutes);
        self
    }
}

/// Outcome of a successful promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub job_id:            JobId,
    pub team_id:           Option<TeamId>,
    pub provider_ids:      Vec<ProviderId>,
    pub assignments:       Vec<Assignment>,
    pub promoted_lock_ids: Vec<LockId>,
    /// Other live locks of the job, released once it was matched.
    pub released_lock_ids: Vec<LockId>,
}

pub struct LockManager<'a> {
    store:  &'a MatchStore,
    config: &'a LockConfig,
}

impl<'a> LockManager<'a> {
    pub fn new(store: &'a MatchStore, config: &'a LockConfig) -> Self {
        Self { store, config }
    }

    pub fn ttl(&self, requested_minutes: Option<i64>) -> Duration {
        let minutes = requested_minutes
            .unwrap_or(self.config.default_ttl_minutes)
            .max(self.config.min_ttl_minutes);
        Duration::minutes(minutes)
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub fn create_locks(
        &self,
        actor: &Actor,
        job_id: &str,
        request: &LockRequest,
        now: DateTime<Utc>,
    ) -> MatchResult<Vec<LockRecord>> {
        actor.require_operational("create locks")?;
        let expires_at = now + self.ttl(request.ttl_minutes);

        self.store.atomic(|s| {
            let job = require(s.get_job(job_id)?, "job", job_id)?;
            if matches!(job.status, JobStatus::Cancelled | JobStatus::Completed) {
                return Err(MatchError::validation(format!(
                    "job {job_id} is {} and cannot be locked",
                    job.status.as_str()
                )));
            }
            let window = job.window();
            let new_lock = |target: LockTarget, count: u32| LockRecord {
                id: new_id("lock"),
                job_id: job_id.to_string(),
                target,
                locked_count: count,
                status: LockStatus::Held,
                release_reason: None,
                expires_at,
                created_at: now,
                updated_at: now,
            };

            match &request.target {
                LockTargetRequest::Team { team_id, units } => {
                    let units = units.unwrap_or(job.required_members);
                    validate_headcount(units)?;
                    let slot = capacity::ensure_slot_in_tx(s, team_id, window.start, window.end, now)?;
                    let plan = require(s.get_plan_by_id(&slot.plan_id)?, "capacity plan", &slot.plan_id)?;
                    // The day may book up to its planned total, or a wider live window.
                    let day_ceiling = plan.capacity_slots.max(slot.capacity) as i64;
                    let headroom = slot.headroom().min(day_ceiling - plan.capacity_booked as i64);
                    if headroom <= 0 {
                        return Err(MatchError::Conflict(ConflictKind::CapacityExceeded {
                            slot_id: slot.id.clone(),
                            headroom,
                        }));
                    }
                    let count = units.min(headroom as u32);
                    let lock = new_lock(
                        LockTarget::Team { team_id: team_id.clone(), slot_id: slot.id.clone() },
                        count,
                    );
                    s.insert_lock(&lock)?;
                    s.adjust_booking(&slot, count as i64, now)?;
                    log::info!(
                        "locks: {} holds {count}/{units} unit(s) of slot {} for job {job_id}",
                        lock.id,
                        slot.id
                    );
                    Ok(vec![lock])
                }
                LockTargetRequest::Providers { provider_ids } => {
                    if provider_ids.is_empty() {
                        return Err(MatchError::validation("lock target has no providers"));
                    }
                    let mut seen = HashSet::new();
                    let mut locks = Vec::with_capacity(provider_ids.len());
                    for pid in provider_ids {
                        if !seen.insert(pid.as_str()) {
                            return Err(MatchError::Conflict(ConflictKind::DuplicateMember {
                                provider_id: pid.clone(),
                            }));
                        }
                        if !s.provider_exists(pid)? {
                            return Err(MatchError::not_found("provider", pid));
                        }
                        if s.provider_has_active_lock(pid, &window, now, None)? {
                            return Err(MatchError::Conflict(ConflictKind::ProviderAlreadyLocked {
                                provider_id: pid.clone(),
                            }));
                        }
                        if s.has_conflicting_assignment(pid, &window, None)? {
                            return Err(MatchError::Conflict(ConflictKind::ProviderAlreadyAssigned {
                                provider_id: pid.clone(),
                            }));
                        }
                        let lock = new_lock(LockTarget::Provider { provider_id: pid.clone() }, 1);
                        s.insert_lock(&lock)?;
                        locks.push(lock);
                    }
                    log::info!("locks: {} provider lock(s) held for job {job_id}", locks.len());
                    Ok(locks)
                }
            }
        })
    }

    // ── Confirm ─────────────────────────────────────────────────────────

    /// HELD → CONFIRMED. A lock already past its expiry is confirmed with
    /// `expires_at = now`, so the expiry sweep still reclaims it.
    pub fn confirm_locks(
        &self,
        actor: &Actor,
        job_id: &str,
        ids: Option<&[LockId]>,
        now: DateTime<Utc>,
    ) -> MatchResult<Vec<LockRecord>> {
        actor.require_operational("confirm locks")?;
        self.store.atomic(|s| {
            require(s.get_job(job_id)?, "job", job_id)?;
            let mut confirmed = Vec::new();
            for mut lock in s.locks_for_job(job_id, ids, false)? {
                if lock.status != LockStatus::Held {
                    continue;
                }
                if lock.expires_at <= now {
                    lock.expires_at = now;
                }
                s.update_lock_state(&lock.id, LockStatus::Confirmed, None, lock.expires_at, now)?;
                lock.status = LockStatus::Confirmed;
                lock.updated_at = now;
                confirmed.push(lock);
            }
            if !confirmed.is_empty() {
                log::info!("locks: confirmed {} lock(s) for job {job_id}", confirmed.len());
            }
            Ok(confirmed)
        })
    }

    // ── Release ─────────────────────────────────────────────────────────

    pub fn release_locks(
        &self,
        actor: &Actor,
        job_id: &str,
        ids: Option<&[LockId]>,
        now: DateTime<Utc>,
    ) -> MatchResult<Vec<LockRecord>> {
        actor.require_operational("release locks")?;
        self.store.atomic(|s| {
            require(s.get_job(job_id)?, "job", job_id)?;
            let live = s.locks_for_job(job_id, ids, false)?;
            let mut released = Vec::with_capacity(live.len());
            for lock in live {
                released.push(release_in_tx(s, lock, ReleaseReason::Manual, now)?);
            }
            if !released.is_empty() {
                log::info!("locks: released {} lock(s) for job {job_id}", released.len());
            }
            Ok(released)
        })
    }

    /// Release one specific lock if it is still live and past its expiry.
    /// Returns `None` when someone else already moved it.
    pub fn expire_lock(&self, lock_id: &str, now: DateTime<Utc>) -> MatchResult<Option<LockRecord>> {
        self.store.atomic(|s| {
            let lock = require(s.get_lock(lock_id)?, "lock", lock_id)?;
            if !lock.status.is_active() || lock.expires_at > now {
                return Ok(None);
            }
            release_in_tx(s, lock, ReleaseReason::Expired, now).map(Some)
        })
    }

    pub fn list_locks(&self, job_id: &str, include_released: bool) -> MatchResult<Vec<LockRecord>> {
        self.store.locks_for_job(job_id, None, include_released)
    }

    // ── Promote ─────────────────────────────────────────────────────────

    /// Turn confirmed, unexpired locks into assignments. `None` when the
    /// job already has assignments or not enough locks are usable.
    pub fn promote(&self, job_id: &str, now: DateTime<Utc>) -> MatchResult<Option<Promotion>> {
        self.store.atomic(|s| {
            let job = require(s.get_job(job_id)?, "job", job_id)?;
            if job.status != JobStatus::PendingProvider || !s.assignments_for_job(job_id)?.is_empty() {
                return Ok(None);
            }
            let window = job.window();
            let required = job.required_members as usize;
            let live = s.locks_for_job(job_id, None, false)?;
            let usable: Vec<&LockRecord> = live
                .iter()
                .filter(|l| l.status == LockStatus::Confirmed && l.expires_at > now)
                .collect();
            if usable.is_empty() {
                return Ok(None);
            }

            let free = |pid: &str| -> MatchResult<bool> {
                Ok(!s.has_conflicting_assignment(pid, &window, Some(job_id))?)
            };

            // Earliest team lock whose team still has enough free members,
            // taken in member order. A lock clamped to headroom still counts.
            let mut chosen: Option<(Option<TeamId>, Vec<ProviderId>, Vec<LockId>)> = None;
            for lock in &usable {
                let LockTarget::Team { team_id, .. } = &lock.target else { continue };
                let Some(team) = s.get_team(team_id)? else { continue };
                let mut members = team.members.clone();
                members.sort_by(member_order);
                let mut picked = Vec::with_capacity(required);
                for m in members {
                    if picked.len() == required {
                        break;
                    }
                    if free(&m.provider_id)? {
                        picked.push(m.provider_id);
                    }
                }
                if picked.len() == required {
                    chosen = Some((Some(team_id.clone()), picked, vec![lock.id.clone()]));
                    break;
                }
            }

            // Otherwise distinct provider locks, earliest first.
            if chosen.is_none() {
                let mut seen = HashSet::new();
                let mut picked = Vec::new();
                let mut lock_ids = Vec::new();
                for lock in &usable {
                    let LockTarget::Provider { provider_id } = &lock.target else { continue };
                    if picked.len() == required {
                        break;
                    }
                    if seen.insert(provider_id.clone()) && free(provider_id)? {
                        picked.push(provider_id.clone());
                        lock_ids.push(lock.id.clone());
                    }
                }
                if picked.len() == required {
                    chosen = Some((None, picked, lock_ids));
                }
            }

            let Some((team_id, provider_ids, promoted_lock_ids)) = chosen else {
                log::debug!("locks: job {job_id} has too few usable locks to promote");
                return Ok(None);
            };

            let assignments: Vec<Assignment> = provider_ids
                .iter()
                .map(|pid| Assignment {
                    id: new_id("asg"),
                    job_id: job_id.to_string(),
                    provider_id: pid.clone(),
                    team_id: team_id.clone(),
                    start_at: job.start_at,
                    end_at: job.end_at,
                    status: AssignmentStatus::Scheduled,
                    created_at: now,
                })
                .collect();
            for a in &assignments {
                s.insert_assignment(a)?;
            }
            s.mark_job_matched(job_id, now)?;

            // Promoted team units stay booked as committed work.
            let mut released_lock_ids = Vec::new();
            for lock in live {
                if promoted_lock_ids.contains(&lock.id) {
                    s.update_lock_state(&lock.id, LockStatus::Released, Some(ReleaseReason::Promoted), lock.expires_at, now)?;
                } else {
                    let released = release_in_tx(s, lock, ReleaseReason::Promoted, now)?;
                    released_lock_ids.push(released.id);
                }
            }

            log::info!(
                "locks: promoted job {job_id} to {} assignment(s){}",
                assignments.len(),
                team_id.as_deref().map(|t| format!(" on team {t}")).unwrap_or_default()
            );
            Ok(Some(Promotion {
                job_id: job_id.to_string(),
                team_id,
                provider_ids,
                assignments,
                promoted_lock_ids,
                released_lock_ids,
            }))
        })
    }
}

/// Mark a live lock released and hand back its team units. The slot is
/// re-read here, so the decrement never exceeds what is booked.
fn release_in_tx(
    s: &MatchStore,
    mut lock: LockRecord,
    reason: ReleaseReason,
    now: DateTime<Utc>,
) -> MatchResult<LockRecord> {
    if let LockTarget::Team { slot_id, .. } = &lock.target {
        match s.get_slot(slot_id)? {
            Some(slot) => {
                let units = lock.locked_count.min(slot.booked) as i64;
                s.adjust_booking(&slot, -units, now)?;
            }
            None => log::warn!("locks: {} points at missing slot {slot_id}", lock.id),
        }
    }
    s.update_lock_state(&lock.id, LockStatus::Released, Some(reason), lock.expires_at, now)?;
    lock.status = LockStatus::Released;
    lock.release_reason = Some(reason);
    lock.updated_at = now;
    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_has_a_floor() {
        let store = MatchStore::in_memory().unwrap();
        let cfg = LockConfig::default();
        let mgr = LockManager::new(&store, &cfg);
        assert_eq!(mgr.ttl(None), Duration::minutes(15));
        assert_eq!(mgr.ttl(Some(1)), Duration::minutes(5));
        assert_eq!(mgr.ttl(Some(30)), Duration::minutes(30));
    }
}
