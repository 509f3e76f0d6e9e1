//! Team and membership queries.

use super::MatchStore;
use crate::{
    error::MatchResult,
    model::{Team, TeamMember},
};
use rusqlite::{params, OptionalExtension};

impl MatchStore {
    pub fn insert_team(&self, team: &Team) -> MatchResult<()> {
        self.atomic(|s| {
            s.conn.execute(
                "INSERT INTO team (team_id, name, timezone, daily_capacity_cap, active)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    team.id,
                    team.name,
                    team.timezone,
                    team.daily_capacity_cap,
                    team.active,
                ],
            )?;
            for service in &team.services {
                s.conn.execute(
                    "INSERT OR IGNORE INTO team_service (team_id, service) VALUES (?1, ?2)",
                    params![team.id, service],
                )?;
            }
            s.replace_team_members(&team.id, &team.members)
        })
    }

    pub fn replace_team_members(&self, team_id: &str, members: &[TeamMember]) -> MatchResult<()> {
        self.atomic(|s| {
            s.conn.execute("DELETE FROM team_member WHERE team_id = ?1", params![team_id])?;
            for m in members {
                s.conn.execute(
                    "INSERT INTO team_member (team_id, provider_id, is_lead, order_index)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![team_id, m.provider_id, m.is_lead, m.order_index],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_team_active(&self, team_id: &str, active: bool) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE team SET active = ?1 WHERE team_id = ?2",
            params![active, team_id],
        )?;
        Ok(())
    }

    pub fn get_team(&self, team_id: &str) -> MatchResult<Option<Team>> {
        let base = self
            .conn
            .query_row(
                "SELECT team_id, name, timezone, daily_capacity_cap, active
                 FROM team WHERE team_id = ?1",
                params![team_id],
                |r| {
                    Ok(Team {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        timezone: r.get(2)?,
                        daily_capacity_cap: r.get(3)?,
                        active: r.get(4)?,
                        services: Vec::new(),
                        members: Vec::new(),
                    })
                },
            )
            .optional()?;
        match base {
            Some(mut team) => {
                self.load_team_children(&mut team)?;
                Ok(Some(team))
            }
            None => Ok(None),
        }
    }

    /// Active teams in insertion order. Team Assembly relies on this
    /// order being stable for its first-found tiebreak.
    pub fn active_teams(&self) -> MatchResult<Vec<Team>> {
        let ids: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT team_id FROM team WHERE active = 1 ORDER BY seq ASC")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut teams = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(team) = self.get_team(&id)? {
                teams.push(team);
            }
        }
        Ok(teams)
    }

    fn load_team_children(&self, team: &mut Team) -> MatchResult<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT service FROM team_service WHERE team_id = ?1 ORDER BY service")?;
        team.services = stmt
            .query_map(params![team.id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT provider_id, is_lead, order_index FROM team_member
             WHERE team_id = ?1 ORDER BY rowid",
        )?;
        team.members = stmt
            .query_map(params![team.id], |r| {
                Ok(TeamMember {
                    provider_id: r.get(0)?,
                    is_lead: r.get(1)?,
                    order_index: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}
