//! The matching engine: one façade over the pipeline.
//!
//! PIPELINE (fixed order):
//!   1. Candidate Filter   (candidates.rs)
//!   2. Scoring Engine     (scoring.rs)
//!   3. Team Assembly      (team.rs), multi-person jobs only
//!   4. Lock Manager / assignment commit (locks.rs, `auto_assign`)
//!
//! RULES:
//!   - Reads (filtering, scoring) may see stale state; every write that
//!     depends on capacity or calendar state re-checks inside `atomic()`.
//!   - Events are dispatched only after the owning transaction commits;
//!     dispatch failures are logged, never returned.
//!   - "Now" always comes from the injected clock.

use crate::{
    access::Actor,
    candidates::{CandidateFilter, MatchCriteria},
    capacity,
    clock::{Clock, ManualClock},
    config::MatchConfig,
    error::{ConflictKind, MatchError, MatchResult},
    event::{EventLogEntry, MatchEvent},
    locks::{LockManager, LockRequest, Promotion},
    model::{
        Assignment, AssignmentMode, AssignmentStatus, CapacityPlan, CapacitySlot, Job, JobStatus,
        LockRecord, Team, TeamMember,
    },
    notify::{LogNotifier, Notifier},
    pricing::{PricingProvider, RateCardPricing},
    scoring::{self, ScoredCandidate},
    store::{require, MatchStore},
    team::{self, NewTeam, Selection, TeamMatch},
    types::{new_id, validate_headcount, ClientId, LockId, ProviderId, TimeWindow},
    weights::{StaticWeightSource, StoreWeightSource, WeightCache, WeightSource},
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};

/// Recipient used for operator-facing events.
pub const OPERATIONS_RECIPIENT: &str = "operations";

/// Booking payload accepted by `create_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub client_id:        ClientId,
    pub service:          String,
    #[serde(default)]
    pub eco_preference:   bool,
    #[serde(default)]
    pub city:             Option<String>,
    #[serde(default)]
    pub postal_code:      Option<String>,
    pub start_at:         DateTime<Utc>,
    pub end_at:           DateTime<Utc>,
    pub required_members: u32,
    #[serde(default)]
    pub surface_m2:       Option<f64>,
    pub assignment_mode:  AssignmentMode,
}

pub struct MatchEngine {
    store:    MatchStore,
    config:   MatchConfig,
    clock:    Arc<dyn Clock>,
    weights:  WeightCache,
    notifier: Box<dyn Notifier>,
    pricing:  Box<dyn PricingProvider>,
}

impl MatchEngine {
    /// Wire an engine with the default collaborators: weights from the
    /// `setting` table (file-backed stores only), log notifications and
    /// rate-card pricing.
    pub fn new(store: MatchStore, config: MatchConfig, clock: Arc<dyn Clock>) -> MatchResult<Self> {
        let source: Box<dyn WeightSource> = if store.is_file_backed() {
            Box::new(StoreWeightSource::new(store.reopen()?))
        } else {
            Box::new(StaticWeightSource(None))
        };
        let weights = WeightCache::new(
            source,
            clock.clone(),
            Duration::seconds(config.scoring.weights_cache_ttl_secs),
            config.scoring.weights,
        );
        let pricing = Box::new(RateCardPricing::new(config.pricing.clone()));
        Ok(Self {
            store,
            config,
            clock,
            weights,
            notifier: Box::new(LogNotifier),
            pricing,
        })
    }

    /// In-memory, migrated engine on a manual clock for tests.
    pub fn build_test(start: DateTime<Utc>) -> MatchResult<(Self, Arc<ManualClock>)> {
        let store = MatchStore::in_memory()?;
        store.migrate()?;
        let clock = Arc::new(ManualClock::new(start));
        let engine = Self::new(store, MatchConfig::default_test(), clock.clone())?;
        Ok((engine, clock))
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_pricing(mut self, pricing: Box<dyn PricingProvider>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_weight_source(mut self, source: Box<dyn WeightSource>) -> Self {
        self.weights = WeightCache::new(
            source,
            self.clock.clone(),
            Duration::seconds(self.config.scoring.weights_cache_ttl_secs),
            self.config.scoring.weights,
        );
        self
    }

    pub fn store(&self) -> &MatchStore {
        &self.store
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn weights(&self) -> &WeightCache {
        &self.weights
    }

    fn locks(&self) -> LockManager<'_> {
        LockManager::new(&self.store, &self.config.locks)
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn create_job(&self, new: NewJob) -> MatchResult<Job> {
        TimeWindow::new(new.start_at, new.end_at)?;
        validate_headcount(new.required_members)?;
        if new.service.trim().is_empty() {
            return Err(MatchError::validation("job service is empty"));
        }
        let now = self.now();
        let job = Job {
            id: new_id("job"),
            client_id: new.client_id,
            service: new.service,
            eco_preference: new.eco_preference,
            city: new.city,
            postal_code: new.postal_code,
            start_at: new.start_at,
            end_at: new.end_at,
            required_members: new.required_members,
            surface_m2: new.surface_m2,
            status: JobStatus::PendingProvider,
            assignment_mode: new.assignment_mode,
            matching_retry_count: 0,
            fallback_team_candidate: None,
            fallback_requested_at: None,
            fallback_escalated_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_job(&job)?;
        log::debug!("engine: job {} created for {}", job.id, job.service);
        Ok(job)
    }

    /// Cancel a job and its live assignments. Locks are left to the
    /// caller's release workflow.
    pub fn cancel_job(&self, actor: &Actor, job_id: &str) -> MatchResult<Job> {
        actor.require_operational("cancel jobs")?;
        let now = self.now();
        self.store.atomic(|s| {
            let mut job = require(s.get_job(job_id)?, "job", job_id)?;
            for a in s.assignments_for_job(job_id)? {
                s.set_assignment_status(&a.id, AssignmentStatus::Cancelled)?;
            }
            s.set_job_status(job_id, JobStatus::Cancelled, now)?;
            job.status = JobStatus::Cancelled;
            job.updated_at = now;
            log::info!("engine: job {job_id} cancelled by {}", actor.id);
            Ok(job)
        })
    }

    // ── Ranking ─────────────────────────────────────────────────────────

    fn price_ceiling(&self, criteria: &MatchCriteria) -> Option<f64> {
        if criteria.price_ceiling.is_some() {
            return criteria.price_ceiling;
        }
        let hours = criteria.window.duration_hours();
        match self.pricing.price_ceiling(criteria.surface_m2, hours, criteria.eco_required) {
            Ok(ceiling) => ceiling,
            Err(e) => {
                log::warn!("engine: pricing failed, ranking without a ceiling: {e}");
                None
            }
        }
    }

    fn rank_at(&self, criteria: &MatchCriteria, now: DateTime<Utc>) -> MatchResult<Vec<ScoredCandidate>> {
        validate_headcount(criteria.required_members)?;
        let candidates = CandidateFilter::new(&self.store, &self.config).candidates(criteria, now)?;
        let mut criteria = criteria.clone();
        criteria.price_ceiling = self.price_ceiling(&criteria);
        let weights = self.weights.current();
        Ok(scoring::rank(&candidates, &criteria, &weights, &self.config.scoring))
    }

    /// Ranked provider ids, best first.
    pub fn match_providers(&self, criteria: &MatchCriteria, limit: usize) -> MatchResult<Vec<ProviderId>> {
        Ok(self
            .rank_at(criteria, self.now())?
            .into_iter()
            .take(limit)
            .map(|c| c.provider_id)
            .collect())
    }

    /// Ranked list with the per-component breakdown.
    pub fn preview_scores(&self, criteria: &MatchCriteria, limit: usize) -> MatchResult<Vec<ScoredCandidate>> {
        let mut ranked = self.rank_at(criteria, self.now())?;
        ranked.truncate(limit);
        Ok(ranked)
    }

    // ── Team Assembly ───────────────────────────────────────────────────

    pub fn match_team_at(
        &self,
        criteria: &MatchCriteria,
        required: u32,
        now: DateTime<Utc>,
    ) -> MatchResult<Option<TeamMatch>> {
        validate_headcount(required)?;
        let ranked = self.rank_at(criteria, now)?;
        let teams = self.store.active_teams()?;
        Ok(team::pick_team(&teams, &criteria.service, &team::load_map(&ranked), required))
    }

    pub fn match_team(&self, criteria: &MatchCriteria, required: u32) -> MatchResult<Option<TeamMatch>> {
        self.match_team_at(criteria, required, self.now())
    }

    /// The first `required` members of the team, in member order, that
    /// pass the candidate pipeline for `criteria`.
    pub fn ensure_team_eligible(
        &self,
        team_id: &str,
        criteria: &MatchCriteria,
        required: u32,
    ) -> MatchResult<Vec<ProviderId>> {
        validate_headcount(required)?;
        let team = require(self.store.get_team(team_id)?, "team", team_id)?;
        if !team.active {
            return Err(MatchError::validation(format!("team {team_id} is inactive")));
        }
        let ids: Vec<ProviderId> = team.members.iter().map(|m| m.provider_id.clone()).collect();
        let scoped = criteria.clone().restricted_to(&ids);
        let eligible: HashSet<ProviderId> = self
            .rank_at(&scoped, self.now())?
            .into_iter()
            .map(|c| c.provider_id)
            .collect();
        team::eligible_members(&team, &eligible, required)
    }

    pub fn ensure_providers_eligible(&self, provider_ids: &[ProviderId], criteria: &MatchCriteria) -> MatchResult<()> {
        if provider_ids.is_empty() {
            return Err(MatchError::validation("provider list is empty"));
        }
        for id in provider_ids {
            if !self.store.provider_exists(id)? {
                return Err(MatchError::not_found("provider", id));
            }
        }
        let scoped = criteria.clone().restricted_to(provider_ids);
        let eligible: HashSet<ProviderId> = self
            .rank_at(&scoped, self.now())?
            .into_iter()
            .map(|c| c.provider_id)
            .collect();
        team::check_provider_list(provider_ids, &eligible)
    }

    // ── Automatic assignment ────────────────────────────────────────────

    pub fn auto_assign(&self, job_id: &str) -> MatchResult<Option<Selection>> {
        self.auto_assign_at(job_id, self.now())
    }

    /// Run the pipeline for a persisted job and commit assignments. `None`
    /// when the job is no longer pending or the pipeline cannot staff it.
    pub fn auto_assign_at(&self, job_id: &str, now: DateTime<Utc>) -> MatchResult<Option<Selection>> {
        let job = require(self.store.get_job(job_id)?, "job", job_id)?;
        if job.status != JobStatus::PendingProvider {
            return Ok(None);
        }
        let criteria = MatchCriteria::for_job(&job);
        let ranked = self.rank_at(&criteria, now)?;
        let teams = self.store.active_teams()?;
        let selection = team::select(&teams, &job.service, &ranked, job.required_members);
        if selection.provider_ids().len() < job.required_members as usize {
            log::debug!(
                "engine: job {job_id} found {}/{} provider(s)",
                selection.provider_ids().len(),
                job.required_members
            );
            return Ok(None);
        }

        let window = job.window();
        let committed = self.store.atomic(|s| {
            let fresh = require(s.get_job(job_id)?, "job", job_id)?;
            if fresh.status != JobStatus::PendingProvider || !s.assignments_for_job(job_id)?.is_empty() {
                return Ok(false);
            }
            for pid in selection.provider_ids() {
                if s.has_conflicting_assignment(pid, &window, Some(job_id))? {
                    return Err(MatchError::Conflict(ConflictKind::ProviderAlreadyAssigned {
                        provider_id: pid.clone(),
                    }));
                }
                if s.provider_has_active_lock(pid, &window, now, Some(job_id))? {
                    return Err(MatchError::Conflict(ConflictKind::ProviderAlreadyLocked {
                        provider_id: pid.clone(),
                    }));
                }
            }
            for pid in selection.provider_ids() {
                s.insert_assignment(&Assignment {
                    id: new_id("asg"),
                    job_id: job_id.to_string(),
                    provider_id: pid.clone(),
                    team_id: selection.team_id().map(str::to_string),
                    start_at: job.start_at,
                    end_at: job.end_at,
                    status: AssignmentStatus::Scheduled,
                    created_at: now,
                })?;
            }
            s.mark_job_matched(job_id, now)?;
            Ok(true)
        })?;
        if !committed {
            return Ok(None);
        }

        log::info!(
            "engine: job {job_id} matched to {}",
            selection.provider_ids().join(",")
        );
        self.dispatch(
            vec![MatchEvent::JobMatched {
                job_id: job_id.to_string(),
                provider_ids: selection.provider_ids().to_vec(),
                team_id: selection.team_id().map(str::to_string),
            }],
            now,
        );
        Ok(Some(selection))
    }

    // ── Capacity Ledger ─────────────────────────────────────────────────

    pub fn ensure_slot(&self, team_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> MatchResult<CapacitySlot> {
        capacity::ensure_slot(&self.store, team_id, start, end, self.now())
    }

    pub fn generate_plans_for_range(&self, team_id: &str, start: NaiveDate, end: NaiveDate) -> MatchResult<Vec<CapacityPlan>> {
        capacity::generate_plans_for_range(&self.store, team_id, start, end, self.now())
    }

    // ── Teams ───────────────────────────────────────────────────────────

    pub fn create_team(&self, actor: &Actor, payload: NewTeam) -> MatchResult<Team> {
        team::create_team(&self.store, actor, payload)
    }

    pub fn replace_team_members(
        &self,
        actor: &Actor,
        team_id: &str,
        members: Vec<TeamMember>,
    ) -> MatchResult<Team> {
        team::replace_members(&self.store, actor, team_id, members)
    }

    // ── Locks ───────────────────────────────────────────────────────────

    pub fn create_locks(&self, actor: &Actor, job_id: &str, request: &LockRequest) -> MatchResult<Vec<LockRecord>> {
        let now = self.now();
        let locks = self.locks().create_locks(actor, job_id, request, now)?;
        self.dispatch(
            vec![MatchEvent::LocksCreated {
                job_id: job_id.to_string(),
                lock_ids: locks.iter().map(|l| l.id.clone()).collect(),
                units: locks.iter().map(|l| l.locked_count).sum(),
            }],
            now,
        );
        Ok(locks)
    }

    pub fn confirm_locks(&self, actor: &Actor, job_id: &str, ids: Option<&[LockId]>) -> MatchResult<Vec<LockRecord>> {
        let now = self.now();
        let locks = self.locks().confirm_locks(actor, job_id, ids, now)?;
        if !locks.is_empty() {
            self.dispatch(
                vec![MatchEvent::LocksConfirmed {
                    job_id: job_id.to_string(),
                    lock_ids: locks.iter().map(|l| l.id.clone()).collect(),
                }],
                now,
            );
        }
        Ok(locks)
    }

    pub fn release_locks(&self, actor: &Actor, job_id: &str, ids: Option<&[LockId]>) -> MatchResult<Vec<LockRecord>> {
        let now = self.now();
        let locks = self.locks().release_locks(actor, job_id, ids, now)?;
        if !locks.is_empty() {
            self.dispatch(
                vec![MatchEvent::LocksReleased {
                    job_id: job_id.to_string(),
                    lock_ids: locks.iter().map(|l| l.id.clone()).collect(),
                    reason: "manual".into(),
                }],
                now,
            );
        }
        Ok(locks)
    }

    pub fn list_locks(&self, job_id: &str, include_released: bool) -> MatchResult<Vec<LockRecord>> {
        self.locks().list_locks(job_id, include_released)
    }

    pub fn promote_locks_at(&self, job_id: &str, now: DateTime<Utc>) -> MatchResult<Option<Promotion>> {
        let Some(promotion) = self.locks().promote(job_id, now)? else {
            return Ok(None);
        };
        self.dispatch(
            vec![
                MatchEvent::LocksPromoted {
                    job_id: promotion.job_id.clone(),
                    lock_ids: promotion.promoted_lock_ids.clone(),
                    provider_ids: promotion.provider_ids.clone(),
                    team_id: promotion.team_id.clone(),
                },
                MatchEvent::JobMatched {
                    job_id: promotion.job_id.clone(),
                    provider_ids: promotion.provider_ids.clone(),
                    team_id: promotion.team_id.clone(),
                },
            ],
            now,
        );
        Ok(Some(promotion))
    }

    pub fn expire_lock_at(&self, lock_id: &str, now: DateTime<Utc>) -> MatchResult<Option<LockRecord>> {
        let Some(lock) = self.locks().expire_lock(lock_id, now)? else {
            return Ok(None);
        };
        self.dispatch(
            vec![MatchEvent::LocksReleased {
                job_id: lock.job_id.clone(),
                lock_ids: vec![lock.id.clone()],
                reason: "expired".into(),
            }],
            now,
        );
        Ok(Some(lock))
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn recipients(event: &MatchEvent) -> Vec<String> {
        if event.is_operator_facing() {
            return vec![OPERATIONS_RECIPIENT.to_string()];
        }
        match event {
            MatchEvent::JobMatched { provider_ids, .. } | MatchEvent::LocksPromoted { provider_ids, .. } => {
                provider_ids.clone()
            }
            _ => Vec::new(),
        }
    }

    /// Record and notify. Called after commit; failures only log.
    pub fn dispatch(&self, events: Vec<MatchEvent>, now: DateTime<Utc>) {
        for event in events {
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("engine: cannot encode {}: {e}", event.type_name());
                    continue;
                }
            };
            let entry = EventLogEntry {
                id: None,
                job_id: Some(event.job_id().to_string()),
                event_type: event.type_name().to_string(),
                payload,
                created_at: now,
            };
            if let Err(e) = self.store.append_event(&entry) {
                log::warn!("engine: event log append failed for {}: {e}", event.type_name());
            }
            if let Err(e) = self.notifier.emit(&event, &Self::recipients(&event)) {
                log::warn!("engine: notification {} failed: {e}", event.type_name());
            }
        }
    }
}
