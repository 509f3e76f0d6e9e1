//! Capacity plan and slot queries.
//!
//! RULE: `slot.booked` and the owning plan's `capacity_booked` only move
//! together, through `adjust_booking`, inside `atomic()`.

use super::MatchStore;
use crate::{
    error::{MatchError, MatchResult},
    model::{CapacityPlan, CapacitySlot},
    types::{from_epoch, new_id, to_epoch},
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

const DAY_FORMAT: &str = "%Y-%m-%d";

fn plan_from_row(r: &Row<'_>) -> rusqlite::Result<CapacityPlan> {
    let day: String = r.get(2)?;
    let day = NaiveDate::parse_from_str(&day, DAY_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(CapacityPlan {
        id: r.get(0)?,
        team_id: r.get(1)?,
        day,
        capacity_slots: r.get(3)?,
        capacity_booked: r.get(4)?,
    })
}

fn slot_from_row(r: &Row<'_>) -> rusqlite::Result<CapacitySlot> {
    Ok(CapacitySlot {
        id: r.get(0)?,
        team_id: r.get(1)?,
        plan_id: r.get(2)?,
        start_at: from_epoch(r.get(3)?),
        end_at: from_epoch(r.get(4)?),
        capacity: r.get(5)?,
        booked: r.get(6)?,
    })
}

impl MatchStore {
    // ── Plans ─────────────────────────────────────────────────────

    /// Insert or refresh the plan for (team, day). `capacity_booked` is
    /// never touched here.
    pub fn upsert_plan(
        &self,
        team_id: &str,
        day: NaiveDate,
        capacity_slots: u32,
        now: DateTime<Utc>,
    ) -> MatchResult<CapacityPlan> {
        let day_text = day.format(DAY_FORMAT).to_string();
        self.conn.execute(
            "INSERT INTO capacity_plan (plan_id, team_id, day, capacity_slots, capacity_booked, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(team_id, day) DO UPDATE SET
                capacity_slots = excluded.capacity_slots,
                updated_at = excluded.updated_at",
            params![new_id("plan"), team_id, day_text, capacity_slots, to_epoch(now)],
        )?;
        self.get_plan(team_id, day)?
            .ok_or_else(|| MatchError::not_found("capacity plan", format!("{team_id}/{day_text}")))
    }

    pub fn get_plan(&self, team_id: &str, day: NaiveDate) -> MatchResult<Option<CapacityPlan>> {
        Ok(self
            .conn
            .query_row(
                "SELECT plan_id, team_id, day, capacity_slots, capacity_booked
                 FROM capacity_plan WHERE team_id = ?1 AND day = ?2",
                params![team_id, day.format(DAY_FORMAT).to_string()],
                plan_from_row,
            )
            .optional()?)
    }

    pub fn get_plan_by_id(&self, plan_id: &str) -> MatchResult<Option<CapacityPlan>> {
        Ok(self
            .conn
            .query_row(
                "SELECT plan_id, team_id, day, capacity_slots, capacity_booked
                 FROM capacity_plan WHERE plan_id = ?1",
                params![plan_id],
                plan_from_row,
            )
            .optional()?)
    }

    pub fn plans_for_team(&self, team_id: &str) -> MatchResult<Vec<CapacityPlan>> {
        let mut stmt = self.conn.prepare(
            "SELECT plan_id, team_id, day, capacity_slots, capacity_booked
             FROM capacity_plan WHERE team_id = ?1 ORDER BY day ASC",
        )?;
        let rows = stmt.query_map(params![team_id], plan_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Slots ─────────────────────────────────────────────────────

    pub fn find_slot(
        &self,
        team_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MatchResult<Option<CapacitySlot>> {
        Ok(self
            .conn
            .query_row(
                "SELECT slot_id, team_id, plan_id, start_at, end_at, capacity, booked
                 FROM capacity_slot WHERE team_id = ?1 AND start_at = ?2 AND end_at = ?3",
                params![team_id, to_epoch(start), to_epoch(end)],
                slot_from_row,
            )
            .optional()?)
    }

    pub fn get_slot(&self, slot_id: &str) -> MatchResult<Option<CapacitySlot>> {
        Ok(self
            .conn
            .query_row(
                "SELECT slot_id, team_id, plan_id, start_at, end_at, capacity, booked
                 FROM capacity_slot WHERE slot_id = ?1",
                params![slot_id],
                slot_from_row,
            )
            .optional()?)
    }

    pub fn slots_for_plan(&self, plan_id: &str) -> MatchResult<Vec<CapacitySlot>> {
        let mut stmt = self.conn.prepare(
            "SELECT slot_id, team_id, plan_id, start_at, end_at, capacity, booked
             FROM capacity_slot WHERE plan_id = ?1 ORDER BY start_at ASC, slot_id ASC",
        )?;
        let rows = stmt.query_map(params![plan_id], slot_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn insert_slot(&self, slot: &CapacitySlot) -> MatchResult<()> {
        self.conn.execute(
            "INSERT INTO capacity_slot (slot_id, team_id, plan_id, start_at, end_at, capacity, booked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                slot.id,
                slot.team_id,
                slot.plan_id,
                to_epoch(slot.start_at),
                to_epoch(slot.end_at),
                slot.capacity,
                slot.booked,
            ],
        )?;
        Ok(())
    }

    pub fn set_slot_capacity(&self, slot_id: &str, capacity: u32) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE capacity_slot SET capacity = ?1 WHERE slot_id = ?2",
            params![capacity, slot_id],
        )?;
        Ok(())
    }

    /// Move `slot.booked` and its plan's `capacity_booked` by `delta` in
    /// lockstep, flooring both at zero. Caller must be inside `atomic()`.
    pub fn adjust_booking(&self, slot: &CapacitySlot, delta: i64, now: DateTime<Utc>) -> MatchResult<()> {
        debug_assert!(!self.conn.is_autocommit(), "adjust_booking outside a transaction");
        self.conn.execute(
            "UPDATE capacity_slot SET booked = MAX(0, booked + ?1) WHERE slot_id = ?2",
            params![delta, slot.id],
        )?;
        self.conn.execute(
            "UPDATE capacity_plan SET capacity_booked = MAX(0, capacity_booked + ?1), updated_at = ?2
             WHERE plan_id = ?3",
            params![delta, to_epoch(now), slot.plan_id],
        )?;
        Ok(())
    }
}
