//! Retry & Escalation Scheduler.
//!
//! EXECUTION ORDER (fixed):
//!   1. UnmatchedRetrySweep  : re-run the pipeline for stale pending jobs
//!   2. LockPromotionSweep   : confirmed locks → assignments
//!   3. ExpiredLockSweep     : reclaim capacity from lapsed locks
//!
//! RULES:
//!   - Every sweep is idempotent and safe to overlap with API calls.
//!   - One failing job or lock is logged and skipped; the batch goes on.
//!   - Nothing here propagates an error out of `run_once`.

use crate::{
    candidates::MatchCriteria,
    config::SchedulerConfig,
    engine::MatchEngine,
    error::MatchResult,
    event::MatchEvent,
    model::{Job, JobStatus},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub sweep:     String,
    pub examined:  u32,
    pub succeeded: u32,
    pub failed:    u32,
}

impl SweepReport {
    fn new(sweep: &str) -> Self {
        Self { sweep: sweep.to_string(), examined: 0, succeeded: 0, failed: 0 }
    }
}

/// The contract every periodic sweep fulfils.
pub trait Sweep: Send {
    /// Unique stable name, used in logs and reports.
    fn name(&self) -> &'static str;

    fn run(&self, engine: &MatchEngine, now: DateTime<Utc>) -> MatchResult<SweepReport>;
}

// ── 1. Unmatched-job retry ───────────────────────────────────────────────────

pub struct UnmatchedRetrySweep {
    config: SchedulerConfig,
}

impl UnmatchedRetrySweep {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Failure bookkeeping for one job: bump the capped counter, request a
    /// fallback on the first miss, escalate once at the cap.
    ///
    /// The job is re-read inside the write transaction. A job that is no
    /// longer pending, or that another sweep touched after `stale_before`,
    /// is left alone, so overlapping sweeps record one failure per cycle.
    fn record_failure(
        &self,
        engine: &MatchEngine,
        snapshot: &Job,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> MatchResult<()> {
        let max = self.config.max_retries;
        let fallback_team = if snapshot.fallback_requested_at.is_none() {
            let criteria = MatchCriteria::for_job(snapshot);
            match engine.match_team_at(&criteria, snapshot.required_members, now) {
                Ok(found) => found.map(|m| m.team_id),
                Err(e) => {
                    log::warn!("sweep(retry): fallback team lookup failed for {}: {e}", snapshot.id);
                    None
                }
            }
        } else {
            None
        };

        let events = engine.store().atomic(|s| {
            let Some(mut job) = s.get_job(&snapshot.id)? else {
                return Ok(Vec::new());
            };
            if job.status != JobStatus::PendingProvider || job.updated_at > stale_before {
                log::debug!("sweep(retry): {} moved on since listing, skipped", job.id);
                return Ok(Vec::new());
            }

            job.matching_retry_count = (job.matching_retry_count + 1).min(max);
            let mut events = vec![MatchEvent::MatchRetryFailed {
                job_id: job.id.clone(),
                retry_count: job.matching_retry_count,
            }];

            if job.fallback_requested_at.is_none() {
                job.fallback_requested_at = Some(now);
                job.fallback_team_candidate = fallback_team.clone();
                events.push(MatchEvent::FallbackRequested {
                    job_id: job.id.clone(),
                    team_candidate: job.fallback_team_candidate.clone(),
                });
            }

            if job.matching_retry_count >= max && job.fallback_escalated_at.is_none() {
                job.fallback_escalated_at = Some(now);
                log::warn!(
                    "sweep(retry): job {} escalated after {} attempt(s)",
                    job.id,
                    job.matching_retry_count
                );
                events.push(MatchEvent::JobEscalated {
                    job_id: job.id.clone(),
                    retry_count: job.matching_retry_count,
                    team_candidate: job.fallback_team_candidate.clone(),
                });
            }

            s.save_matching_state(&job, now)?;
            Ok(events)
        })?;
        engine.dispatch(events, now);
        Ok(())
    }
}

impl Sweep for UnmatchedRetrySweep {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn run(&self, engine: &MatchEngine, now: DateTime<Utc>) -> MatchResult<SweepReport> {
        let stale_before = now - Duration::minutes(self.config.stale_after_minutes);
        let jobs = engine
            .store()
            .jobs_due_for_retry(now, stale_before, self.config.max_retries)?;
        let mut report = SweepReport::new(self.name());

        for job in jobs {
            report.examined += 1;
            let job_id = job.id.clone();
            let outcome = match engine.auto_assign_at(&job_id, now) {
                Ok(Some(_)) => Ok(true),
                Ok(None) => self.record_failure(engine, &job, now, stale_before).map(|_| false),
                Err(e) => {
                    log::warn!("sweep(retry): matching {job_id} failed: {e}");
                    self.record_failure(engine, &job, now, stale_before).map(|_| false)
                }
            };
            match outcome {
                Ok(true) => report.succeeded += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("sweep(retry): skipping {job_id}: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

// ── 2. Lock promotion ────────────────────────────────────────────────────────

pub struct LockPromotionSweep;

impl Sweep for LockPromotionSweep {
    fn name(&self) -> &'static str {
        "promotion"
    }

    fn run(&self, engine: &MatchEngine, now: DateTime<Utc>) -> MatchResult<SweepReport> {
        let mut report = SweepReport::new(self.name());
        for job in engine.store().jobs_with_promotable_locks(now)? {
            report.examined += 1;
            match engine.promote_locks_at(&job.id, now) {
                Ok(Some(_)) => report.succeeded += 1,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("sweep(promotion): skipping {}: {e}", job.id);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

// ── 3. Expired locks ─────────────────────────────────────────────────────────

pub struct ExpiredLockSweep {
    batch: u32,
}

impl ExpiredLockSweep {
    pub fn new(batch: u32) -> Self {
        Self { batch }
    }
}

impl Sweep for ExpiredLockSweep {
    fn name(&self) -> &'static str {
        "expiry"
    }

    fn run(&self, engine: &MatchEngine, now: DateTime<Utc>) -> MatchResult<SweepReport> {
        let mut report = SweepReport::new(self.name());
        for lock in engine.store().expired_active_locks(now, self.batch)? {
            report.examined += 1;
            match engine.expire_lock_at(&lock.id, now) {
                Ok(Some(_)) => report.succeeded += 1,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("sweep(expiry): skipping lock {}: {e}", lock.id);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

// ── Runner ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// One cycle per `run_once` call.
    Manual,
    Interval(std::time::Duration),
}

pub struct SweepScheduler {
    sweeps:  Vec<Box<dyn Sweep>>,
    trigger: Trigger,
}

impl SweepScheduler {
    pub fn new(trigger: Trigger) -> Self {
        Self { sweeps: Vec::new(), trigger }
    }

    /// The three standard sweeps in execution order.
    pub fn standard(config: &SchedulerConfig, trigger: Trigger) -> Self {
        let mut scheduler = Self::new(trigger);
        scheduler.register(Box::new(UnmatchedRetrySweep::new(config.clone())));
        scheduler.register(Box::new(LockPromotionSweep));
        scheduler.register(Box::new(ExpiredLockSweep::new(config.expired_lock_batch)));
        scheduler
    }

    pub fn register(&mut self, sweep: Box<dyn Sweep>) {
        self.sweeps.push(sweep);
    }

    /// One cycle at the engine clock's "now".
    pub fn run_once(&self, engine: &MatchEngine) -> Vec<SweepReport> {
        let now = engine.now();
        self.sweeps
            .iter()
            .map(|sweep| match sweep.run(engine, now) {
                Ok(report) => {
                    log::debug!(
                        "sweep({}): examined={} ok={} failed={}",
                        report.sweep,
                        report.examined,
                        report.succeeded,
                        report.failed
                    );
                    report
                }
                Err(e) => {
                    log::warn!("sweep({}): aborted: {e}", sweep.name());
                    SweepReport { failed: 1, ..SweepReport::new(sweep.name()) }
                }
            })
            .collect()
    }

    /// Cycle until `shutdown` is set. A manual trigger runs a single
    /// cycle. Returns the number of cycles run.
    pub fn run_until(&self, engine: &MatchEngine, shutdown: &AtomicBool) -> u64 {
        let interval = match self.trigger {
            Trigger::Manual => {
                self.run_once(engine);
                return 1;
            }
            Trigger::Interval(d) => d,
        };
        let step = std::time::Duration::from_millis(100).min(interval);
        let mut cycles = 0;
        while !shutdown.load(Ordering::SeqCst) {
            self.run_once(engine);
            cycles += 1;
            let mut waited = std::time::Duration::ZERO;
            while waited < interval && !shutdown.load(Ordering::SeqCst) {
                std::thread::sleep(step);
                waited += step;
            }
        }
        cycles
    }
}
