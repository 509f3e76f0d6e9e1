//! Capacity Ledger (team planning).
//!
//! Daily ceiling per (team, local day) and exact-window slots derived
//! from member availability. Rows are created lazily and recomputed,
//! never deleted.
//!
//! RULE: `ensure_slot` is one atomic unit; lock creation calls the
//!       in-transaction variant so the slot it books against is fresh.

use crate::{
    availability,
    error::{MatchError, MatchResult},
    model::{CapacityPlan, CapacitySlot, Provider, Team},
    store::{require, MatchStore},
    types::{new_id, TimeWindow},
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

fn team_tz(team: &Team) -> MatchResult<Tz> {
    availability::parse_timezone(&team.timezone)
        .ok_or_else(|| MatchError::validation(format!("team {} has unknown timezone '{}'", team.id, team.timezone)))
}

/// Member profiles in team order; members whose provider row is gone
/// are skipped.
fn member_profiles(store: &MatchStore, team: &Team) -> MatchResult<Vec<Provider>> {
    let mut out = Vec::with_capacity(team.members.len());
    for m in &team.members {
        match store.get_provider(&m.provider_id)? {
            Some(p) if p.active => out.push(p),
            Some(_) => {}
            None => log::warn!("capacity: team {} lists missing provider {}", team.id, m.provider_id),
        }
    }
    Ok(out)
}

/// `min(members available on day, cap or member count)`.
pub fn daily_capacity(team: &Team, members: &[Provider], day: NaiveDate, tz: Tz) -> u32 {
    let available = members
        .iter()
        .filter(|p| availability::available_on_day(&p.slots, &p.time_off, day, tz))
        .count() as u32;
    let ceiling = team.daily_capacity_cap.unwrap_or(team.members.len() as u32);
    available.min(ceiling)
}

/// Upsert one plan per team-local day in `[start, end]`. Re-running it
/// converges on the same numbers.
pub fn generate_plans_for_range(
    store: &MatchStore,
    team_id: &str,
    start: NaiveDate,
    end: NaiveDate,
    now: DateTime<Utc>,
) -> MatchResult<Vec<CapacityPlan>> {
    if end < start {
        return Err(MatchError::validation(format!("plan range end {end} is before start {start}")));
    }
    let team = require(store.get_team(team_id)?, "team", team_id)?;
    let tz = team_tz(&team)?;
    let members = member_profiles(store, &team)?;

    store.atomic(|s| {
        let mut plans = Vec::new();
        let mut day = start;
        while day <= end {
            let cap = daily_capacity(&team, &members, day, tz);
            plans.push(s.upsert_plan(team_id, day, cap, now)?);
            day += Duration::days(1);
        }
        log::debug!("capacity: {team_id} planned {} day(s) from {start}", plans.len());
        Ok(plans)
    })
}

/// Return the slot for exactly `[start, end)` with freshly computed
/// capacity, creating it (booked 0) if absent.
pub fn ensure_slot(
    store: &MatchStore,
    team_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MatchResult<CapacitySlot> {
    store.atomic(|s| ensure_slot_in_tx(s, team_id, start, end, now))
}

/// `ensure_slot` body; the caller holds the transaction.
pub fn ensure_slot_in_tx(
    store: &MatchStore,
    team_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MatchResult<CapacitySlot> {
    let window = TimeWindow::new(start, end)?;
    let team = require(store.get_team(team_id)?, "team", team_id)?;
    let tz = team_tz(&team)?;
    let members = member_profiles(store, &team)?;

    let day = start.with_timezone(&tz).date_naive();
    let ceiling = daily_capacity(&team, &members, day, tz);
    let plan = store.upsert_plan(team_id, day, ceiling, now)?;

    let covering = members
        .iter()
        .filter(|p| availability::covers_exactly(&p.slots, &p.time_off, &window))
        .count() as u32;
    let capacity = covering.min(ceiling);

    match store.find_slot(team_id, start, end)? {
        Some(mut slot) => {
            if slot.capacity != capacity {
                log::debug!(
                    "capacity: slot {} capacity {} -> {capacity}",
                    slot.id,
                    slot.capacity
                );
                store.set_slot_capacity(&slot.id, capacity)?;
                slot.capacity = capacity;
            }
            Ok(slot)
        }
        None => {
            let slot = CapacitySlot {
                id: new_id("slot"),
                team_id: team_id.to_string(),
                plan_id: plan.id,
                start_at: start,
                end_at: end,
                capacity,
                booked: 0,
            };
            store.insert_slot(&slot)?;
            log::debug!("capacity: created slot {} for {team_id} capacity {capacity}", slot.id);
            Ok(slot)
        }
    }
}
