//! Team Assembly and team management.
//!
//! RULE: member ordering is defined once, by `member_order`, and used by
//!       assembly, eligibility checks and lock promotion alike.
//! RULE: ties between teams go to the first team in insertion order.

use crate::{
    access::Actor,
    availability,
    error::{ConflictKind, MatchError, MatchResult},
    model::{Team, TeamMember},
    scoring::ScoredCandidate,
    store::{require, MatchStore},
    types::{new_id, validate_headcount, ProviderId, TeamId},
};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

/// Lead first, then ascending order index, then provider id.
pub fn member_order(a: &TeamMember, b: &TeamMember) -> Ordering {
    b.is_lead
        .cmp(&a.is_lead)
        .then_with(|| a.order_index.cmp(&b.order_index))
        .then_with(|| a.provider_id.cmp(&b.provider_id))
}

pub fn ordered_members(team: &Team) -> Vec<&TeamMember> {
    let mut members: Vec<&TeamMember> = team.members.iter().collect();
    members.sort_by(|a, b| member_order(a, b));
    members
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMatch {
    pub team_id:    TeamId,
    pub member_ids: Vec<ProviderId>,
    pub total_load: f64,
}

/// Result of multi-person selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selection {
    Team(TeamMatch),
    /// Top of the individual ranking; may hold fewer than requested.
    Individuals { provider_ids: Vec<ProviderId> },
}

impl Selection {
    pub fn provider_ids(&self) -> &[ProviderId] {
        match self {
            Selection::Team(m) => &m.member_ids,
            Selection::Individuals { provider_ids } => provider_ids,
        }
    }

    pub fn team_id(&self) -> Option<&str> {
        match self {
            Selection::Team(m) => Some(&m.team_id),
            Selection::Individuals { .. } => None,
        }
    }
}

/// Eligible ids of a ranked list mapped to their load.
pub fn load_map(ranked: &[ScoredCandidate]) -> HashMap<ProviderId, f64> {
    ranked
        .iter()
        .filter(|c| c.tier.is_available())
        .map(|c| (c.provider_id.clone(), c.load))
        .collect()
}

/// Minimal-total-load team among `teams` that can staff `required`
/// members from the eligible set.
pub fn pick_team(
    teams: &[Team],
    service: &str,
    loads: &HashMap<ProviderId, f64>,
    required: u32,
) -> Option<TeamMatch> {
    let required = required as usize;
    let mut best: Option<TeamMatch> = None;
    for team in teams.iter().filter(|t| t.active && t.offers(service)) {
        let eligible: Vec<&TeamMember> = ordered_members(team)
            .into_iter()
            .filter(|m| loads.contains_key(&m.provider_id))
            .collect();
        if eligible.len() < required {
            continue;
        }
        let chosen = &eligible[..required];
        let total_load: f64 = chosen.iter().map(|m| loads[&m.provider_id]).sum();
        let better = best.as_ref().map_or(true, |b| total_load < b.total_load);
        if better {
            best = Some(TeamMatch {
                team_id: team.id.clone(),
                member_ids: chosen.iter().map(|m| m.provider_id.clone()).collect(),
                total_load,
            });
        }
    }
    best
}

/// Team first, else the top `required` individuals.
pub fn select(teams: &[Team], service: &str, ranked: &[ScoredCandidate], required: u32) -> Selection {
    if required > 1 {
        if let Some(m) = pick_team(teams, service, &load_map(ranked), required) {
            return Selection::Team(m);
        }
    }
    Selection::Individuals {
        provider_ids: ranked
            .iter()
            .take(required as usize)
            .map(|c| c.provider_id.clone())
            .collect(),
    }
}

/// First `required` members of `team` (in member order) that are in the
/// eligible set.
pub fn eligible_members(team: &Team, eligible: &HashSet<ProviderId>, required: u32) -> MatchResult<Vec<ProviderId>> {
    validate_headcount(required)?;
    let members: Vec<ProviderId> = ordered_members(team)
        .into_iter()
        .filter(|m| eligible.contains(&m.provider_id))
        .map(|m| m.provider_id.clone())
        .collect();
    if (members.len() as u32) < required {
        return Err(MatchError::Conflict(ConflictKind::InsufficientMembers {
            required,
            eligible: members.len() as u32,
        }));
    }
    Ok(members.into_iter().take(required as usize).collect())
}

/// Ad-hoc provider list check: non-empty, unique, all eligible.
pub fn check_provider_list(ids: &[ProviderId], eligible: &HashSet<ProviderId>) -> MatchResult<()> {
    if ids.is_empty() {
        return Err(MatchError::validation("provider list is empty"));
    }
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(MatchError::Conflict(ConflictKind::DuplicateMember { provider_id: id.clone() }));
        }
        if !eligible.contains(id) {
            return Err(MatchError::Conflict(ConflictKind::ProviderNotEligible { provider_id: id.clone() }));
        }
    }
    Ok(())
}

// ── Team management ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTeam {
    pub name:               String,
    pub timezone:           String,
    #[serde(default)]
    pub daily_capacity_cap: Option<u32>,
    #[serde(default)]
    pub services:           Vec<String>,
    pub members:            Vec<TeamMember>,
}

fn validate_members(store: &MatchStore, members: &[TeamMember]) -> MatchResult<()> {
    if members.is_empty() {
        return Err(MatchError::validation("team needs at least one member"));
    }
    let mut seen = HashSet::new();
    for m in members {
        if !seen.insert(m.provider_id.as_str()) {
            return Err(MatchError::Conflict(ConflictKind::DuplicateMember {
                provider_id: m.provider_id.clone(),
            }));
        }
    }
    for m in members {
        if !store.provider_exists(&m.provider_id)? {
            return Err(MatchError::not_found("provider", &m.provider_id));
        }
    }
    Ok(())
}

pub fn create_team(store: &MatchStore, actor: &Actor, payload: NewTeam) -> MatchResult<Team> {
    actor.require_operational("manage teams")?;
    if payload.name.trim().is_empty() {
        return Err(MatchError::validation("team name is empty"));
    }
    if availability::parse_timezone(&payload.timezone).is_none() {
        return Err(MatchError::validation(format!("unknown timezone '{}'", payload.timezone)));
    }
    if payload.daily_capacity_cap == Some(0) {
        return Err(MatchError::validation("daily capacity cap must be at least 1"));
    }
    validate_members(store, &payload.members)?;

    let team = Team {
        id: new_id("team"),
        name: payload.name.trim().to_string(),
        timezone: payload.timezone,
        daily_capacity_cap: payload.daily_capacity_cap,
        active: true,
        services: payload.services,
        members: payload.members,
    };
    store.insert_team(&team)?;
    log::info!("teams: created {} '{}' with {} members", team.id, team.name, team.members.len());
    Ok(team)
}

pub fn replace_members(store: &MatchStore, actor: &Actor, team_id: &str, members: Vec<TeamMember>) -> MatchResult<Team> {
    actor.require_operational("manage teams")?;
    let mut team = require(store.get_team(team_id)?, "team", team_id)?;
    validate_members(store, &members)?;
    store.replace_team_members(team_id, &members)?;
    log::info!("teams: {team_id} now has {} members", members.len());
    team.members = members;
    Ok(team)
}
