//! Job and assignment queries.

use super::{MatchStore, BLOCKING_STATUSES};
use crate::{
    error::MatchResult,
    model::{Assignment, AssignmentMode, AssignmentStatus, Job, JobStatus},
    types::{from_epoch, to_epoch, TimeWindow},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLUMNS: &str = "job_id, client_id, service, eco_preference, city, postal_code,
    start_at, end_at, required_members, surface_m2, status, assignment_mode,
    matching_retry_count, fallback_team_candidate, fallback_requested_at,
    fallback_escalated_at, created_at, updated_at";

fn job_from_row(r: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: r.get(0)?,
        client_id: r.get(1)?,
        service: r.get(2)?,
        eco_preference: r.get(3)?,
        city: r.get(4)?,
        postal_code: r.get(5)?,
        start_at: from_epoch(r.get(6)?),
        end_at: from_epoch(r.get(7)?),
        required_members: r.get(8)?,
        surface_m2: r.get(9)?,
        status: r.get::<_, JobStatus>(10)?,
        assignment_mode: r.get::<_, AssignmentMode>(11)?,
        matching_retry_count: r.get(12)?,
        fallback_team_candidate: r.get(13)?,
        fallback_requested_at: r.get::<_, Option<i64>>(14)?.map(from_epoch),
        fallback_escalated_at: r.get::<_, Option<i64>>(15)?.map(from_epoch),
        created_at: from_epoch(r.get(16)?),
        updated_at: from_epoch(r.get(17)?),
    })
}

fn assignment_from_row(r: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: r.get(0)?,
        job_id: r.get(1)?,
        provider_id: r.get(2)?,
        team_id: r.get(3)?,
        start_at: from_epoch(r.get(4)?),
        end_at: from_epoch(r.get(5)?),
        status: r.get::<_, AssignmentStatus>(6)?,
        created_at: from_epoch(r.get(7)?),
    })
}

impl MatchStore {
    // ── Jobs ──────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &Job) -> MatchResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO job ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            params![
                job.id,
                job.client_id,
                job.service,
                job.eco_preference,
                job.city,
                job.postal_code,
                to_epoch(job.start_at),
                to_epoch(job.end_at),
                job.required_members,
                job.surface_m2,
                job.status,
                job.assignment_mode,
                job.matching_retry_count,
                job.fallback_team_candidate,
                job.fallback_requested_at.map(to_epoch),
                job.fallback_escalated_at.map(to_epoch),
                to_epoch(job.created_at),
                to_epoch(job.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> MatchResult<Option<Job>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?)
    }

    pub fn set_job_status(&self, job_id: &str, status: JobStatus, now: DateTime<Utc>) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE job SET status = ?1, updated_at = ?2 WHERE job_id = ?3",
            params![status, to_epoch(now), job_id],
        )?;
        Ok(())
    }

    /// Persist the retry/fallback bookkeeping fields of `job`.
    pub fn save_matching_state(&self, job: &Job, now: DateTime<Utc>) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE job SET matching_retry_count = ?1,
                            fallback_team_candidate = ?2,
                            fallback_requested_at = ?3,
                            fallback_escalated_at = ?4,
                            updated_at = ?5
             WHERE job_id = ?6",
            params![
                job.matching_retry_count,
                job.fallback_team_candidate,
                job.fallback_requested_at.map(to_epoch),
                job.fallback_escalated_at.map(to_epoch),
                to_epoch(now),
                job.id,
            ],
        )?;
        Ok(())
    }

    /// Mark a job matched: advance status and clear retry/fallback fields.
    pub fn mark_job_matched(&self, job_id: &str, now: DateTime<Utc>) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE job SET status = 'assigned',
                            matching_retry_count = 0,
                            fallback_team_candidate = NULL,
                            fallback_requested_at = NULL,
                            fallback_escalated_at = NULL,
                            updated_at = ?1
             WHERE job_id = ?2",
            params![to_epoch(now), job_id],
        )?;
        Ok(())
    }

    /// Auto-mode jobs still waiting for a provider, starting after `now`,
    /// untouched since `stale_before`, and not yet through the retry budget.
    pub fn jobs_due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        max_retries: u32,
    ) -> MatchResult<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job
             WHERE status = 'pending_provider'
               AND assignment_mode = 'auto'
               AND start_at > ?1
               AND updated_at <= ?2
               AND (matching_retry_count < ?3 OR fallback_escalated_at IS NULL)
             ORDER BY start_at ASC, job_id ASC"
        ))?;
        let rows = stmt.query_map(
            params![to_epoch(now), to_epoch(stale_before), max_retries],
            job_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Pending jobs with no live assignment but at least one confirmed,
    /// unexpired lock.
    pub fn jobs_with_promotable_locks(&self, now: DateTime<Utc>) -> MatchResult<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job j
             WHERE j.status = 'pending_provider'
               AND NOT EXISTS (
                   SELECT 1 FROM assignment a
                   WHERE a.job_id = j.job_id AND a.status != 'cancelled')
               AND EXISTS (
                   SELECT 1 FROM capacity_lock l
                   WHERE l.job_id = j.job_id AND l.status = 'confirmed' AND l.expires_at > ?1)
             ORDER BY j.start_at ASC, j.job_id ASC"
        ))?;
        let rows = stmt.query_map(params![to_epoch(now)], job_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Assignments ───────────────────────────────────────────────

    pub fn insert_assignment(&self, a: &Assignment) -> MatchResult<()> {
        self.conn.execute(
            "INSERT INTO assignment (assignment_id, job_id, provider_id, team_id,
                                     start_at, end_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                a.id,
                a.job_id,
                a.provider_id,
                a.team_id,
                to_epoch(a.start_at),
                to_epoch(a.end_at),
                a.status,
                to_epoch(a.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_assignment_status(&self, assignment_id: &str, status: AssignmentStatus) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE assignment SET status = ?1 WHERE assignment_id = ?2",
            params![status, assignment_id],
        )?;
        Ok(())
    }

    /// Non-cancelled assignments of a job, oldest first.
    pub fn assignments_for_job(&self, job_id: &str) -> MatchResult<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT assignment_id, job_id, provider_id, team_id, start_at, end_at, status, created_at
             FROM assignment
             WHERE job_id = ?1 AND status != 'cancelled'
             ORDER BY created_at ASC, assignment_id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], assignment_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Does the provider hold a calendar-blocking assignment overlapping
    /// `window`, other than on `exclude_job`?
    pub fn has_conflicting_assignment(
        &self,
        provider_id: &str,
        window: &TimeWindow,
        exclude_job: Option<&str>,
    ) -> MatchResult<bool> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM assignment
                 WHERE provider_id = ?1
                   AND start_at < ?2 AND end_at > ?3
                   AND status IN ({BLOCKING_STATUSES})
                   AND (?4 IS NULL OR job_id != ?4)"
            ),
            params![provider_id, to_epoch(window.end), to_epoch(window.start), exclude_job],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }
}
