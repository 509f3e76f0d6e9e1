//! Capacity lock queries.

use super::{placeholders, MatchStore};
use crate::{
    error::MatchResult,
    model::{LockRecord, LockStatus, LockTarget, ReleaseReason},
    types::{from_epoch, to_epoch, TimeWindow},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension, Row};

const LOCK_COLUMNS: &str = "lock_id, job_id, target_kind, team_id, slot_id, provider_id,
    locked_count, status, release_reason, expires_at, created_at, updated_at";

fn lock_from_row(r: &Row<'_>) -> rusqlite::Result<LockRecord> {
    let kind: String = r.get(2)?;
    let target = if kind == "team" {
        LockTarget::Team {
            team_id: r.get(3)?,
            slot_id: r.get(4)?,
        }
    } else {
        LockTarget::Provider {
            provider_id: r.get(5)?,
        }
    };
    Ok(LockRecord {
        id: r.get(0)?,
        job_id: r.get(1)?,
        target,
        locked_count: r.get(6)?,
        status: r.get::<_, LockStatus>(7)?,
        release_reason: r.get::<_, Option<ReleaseReason>>(8)?,
        expires_at: from_epoch(r.get(9)?),
        created_at: from_epoch(r.get(10)?),
        updated_at: from_epoch(r.get(11)?),
    })
}

impl MatchStore {
    pub fn insert_lock(&self, lock: &LockRecord) -> MatchResult<()> {
        let (kind, team_id, slot_id, provider_id) = match &lock.target {
            LockTarget::Team { team_id, slot_id } => ("team", Some(team_id), Some(slot_id), None),
            LockTarget::Provider { provider_id } => ("provider", None, None, Some(provider_id)),
        };
        self.conn.execute(
            &format!(
                "INSERT INTO capacity_lock ({LOCK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                lock.id,
                lock.job_id,
                kind,
                team_id,
                slot_id,
                provider_id,
                lock.locked_count,
                lock.status,
                lock.release_reason,
                to_epoch(lock.expires_at),
                to_epoch(lock.created_at),
                to_epoch(lock.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_lock(&self, lock_id: &str) -> MatchResult<Option<LockRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {LOCK_COLUMNS} FROM capacity_lock WHERE lock_id = ?1"),
                params![lock_id],
                lock_from_row,
            )
            .optional()?)
    }

    /// Locks of a job in creation order, optionally restricted to `ids`.
    pub fn locks_for_job(
        &self,
        job_id: &str,
        ids: Option<&[String]>,
        include_released: bool,
    ) -> MatchResult<Vec<LockRecord>> {
        let mut sql = format!("SELECT {LOCK_COLUMNS} FROM capacity_lock WHERE job_id = ?1");
        let mut values: Vec<Value> = vec![Value::Text(job_id.to_string())];
        if !include_released {
            sql.push_str(" AND status != 'released'");
        }
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND lock_id IN ({})", placeholders(2, ids.len())));
            values.extend(ids.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY seq ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), lock_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_lock_state(
        &self,
        lock_id: &str,
        status: LockStatus,
        reason: Option<ReleaseReason>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE capacity_lock SET status = ?1, release_reason = ?2, expires_at = ?3, updated_at = ?4
             WHERE lock_id = ?5",
            params![status, reason, to_epoch(expires_at), to_epoch(now), lock_id],
        )?;
        Ok(())
    }

    /// Is the provider held by a live provider lock on any job (other
    /// than `exclude_job`) whose window overlaps `window`? Team locks
    /// reserve slot capacity, not individual members, so they are not
    /// counted here.
    pub fn provider_has_active_lock(
        &self,
        provider_id: &str,
        window: &TimeWindow,
        now: DateTime<Utc>,
        exclude_job: Option<&str>,
    ) -> MatchResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM capacity_lock l
             JOIN job j ON j.job_id = l.job_id
             WHERE l.provider_id = ?1
               AND l.status IN ('held', 'confirmed')
               AND l.expires_at > ?2
               AND j.start_at < ?3 AND j.end_at > ?4
               AND (?5 IS NULL OR l.job_id != ?5)",
            params![
                provider_id,
                to_epoch(now),
                to_epoch(window.end),
                to_epoch(window.start),
                exclude_job,
            ],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Live locks past their expiry whose job is still waiting for a
    /// provider, oldest expiry first.
    pub fn expired_active_locks(&self, now: DateTime<Utc>, limit: u32) -> MatchResult<Vec<LockRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM capacity_lock l
             JOIN job j ON j.job_id = l.job_id
             WHERE l.status IN ('held', 'confirmed')
               AND l.expires_at <= ?1
               AND j.status = 'pending_provider'
             ORDER BY l.expires_at ASC, l.seq ASC
             LIMIT ?2",
            LOCK_COLUMNS
                .split(',')
                .map(|c| format!("l.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt.query_map(params![to_epoch(now), limit], lock_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Units held by non-released locks on a slot.
    pub fn active_units_on_slot(&self, slot_id: &str) -> MatchResult<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(locked_count), 0) FROM capacity_lock
             WHERE slot_id = ?1 AND status IN ('held', 'confirmed')",
            params![slot_id],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }
}
