//! Provider profile, availability and history queries.

use super::{placeholders, MatchStore, BLOCKING_STATUSES};
use crate::{
    error::MatchResult,
    model::{AvailabilitySlot, Provider, ProviderKind, TimeOffPeriod},
    types::{from_epoch, to_epoch, TimeWindow},
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension};

/// Stage-one candidate query: service, active flag, eco flag, id set.
#[derive(Debug, Clone, Default)]
pub struct ProviderQuery {
    pub service:  String,
    pub eco_only: bool,
    pub ids:      Option<Vec<String>>,
}

/// History figures feeding the reliability, experience, loyalty and
/// load components.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProviderStats {
    pub recent_assignments:   u32,
    pub recent_cancellations: u32,
    pub total_assignments:    u32,
    pub served_client:        bool,
    pub forward_load:         u32,
}

impl MatchStore {
    // ── Provider writes ───────────────────────────────────────────

    /// Insert a provider with its services, zones, slots and time-off.
    pub fn insert_provider(&self, p: &Provider) -> MatchResult<()> {
        self.atomic(|s| {
            s.conn.execute(
                "INSERT INTO provider (provider_id, display_name, kind, active, eco_friendly,
                                       hourly_rate, rating_average, rating_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    p.id,
                    p.display_name,
                    p.kind,
                    p.active,
                    p.eco_friendly,
                    p.hourly_rate,
                    p.rating_average,
                    p.rating_count,
                ],
            )?;
            for service in &p.services {
                s.conn.execute(
                    "INSERT OR IGNORE INTO provider_service (provider_id, service) VALUES (?1, ?2)",
                    params![p.id, service],
                )?;
            }
            for zone in &p.service_zones {
                s.conn.execute(
                    "INSERT OR IGNORE INTO provider_zone (provider_id, kind, value) VALUES (?1, 'zone', ?2)",
                    params![p.id, zone],
                )?;
            }
            for area in &p.areas {
                s.conn.execute(
                    "INSERT OR IGNORE INTO provider_zone (provider_id, kind, value) VALUES (?1, 'area', ?2)",
                    params![p.id, area],
                )?;
            }
            s.replace_slots(&p.id, &p.slots)?;
            for period in &p.time_off {
                s.add_time_off(&p.id, period)?;
            }
            Ok(())
        })
    }

    pub fn replace_slots(&self, provider_id: &str, slots: &[AvailabilitySlot]) -> MatchResult<()> {
        self.atomic(|s| {
            s.conn.execute(
                "DELETE FROM availability_slot WHERE provider_id = ?1",
                params![provider_id],
            )?;
            for slot in slots {
                s.conn.execute(
                    "INSERT INTO availability_slot (provider_id, weekday, start_minute, end_minute, timezone, active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        provider_id,
                        slot.weekday,
                        slot.start_minute,
                        slot.end_minute,
                        slot.timezone,
                        slot.active,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn add_time_off(&self, provider_id: &str, period: &TimeOffPeriod) -> MatchResult<()> {
        self.conn.execute(
            "INSERT INTO time_off (provider_id, start_at, end_at) VALUES (?1, ?2, ?3)",
            params![provider_id, to_epoch(period.start), to_epoch(period.end)],
        )?;
        Ok(())
    }

    pub fn update_provider_rating(
        &self,
        provider_id: &str,
        rating_average: f64,
        rating_count: u32,
    ) -> MatchResult<()> {
        self.conn.execute(
            "UPDATE provider SET rating_average = ?1, rating_count = ?2 WHERE provider_id = ?3",
            params![rating_average, rating_count, provider_id],
        )?;
        Ok(())
    }

    // ── Provider reads ────────────────────────────────────────────

    pub fn get_provider(&self, provider_id: &str) -> MatchResult<Option<Provider>> {
        let base = self
            .conn
            .query_row(
                "SELECT provider_id, display_name, kind, active, eco_friendly,
                        hourly_rate, rating_average, rating_count
                 FROM provider WHERE provider_id = ?1",
                params![provider_id],
                |r| {
                    Ok(Provider {
                        id: r.get(0)?,
                        display_name: r.get(1)?,
                        kind: r.get::<_, ProviderKind>(2)?,
                        active: r.get(3)?,
                        eco_friendly: r.get(4)?,
                        hourly_rate: r.get(5)?,
                        rating_average: r.get(6)?,
                        rating_count: r.get(7)?,
                        services: Vec::new(),
                        service_zones: Vec::new(),
                        areas: Vec::new(),
                        slots: Vec::new(),
                        time_off: Vec::new(),
                    })
                },
            )
            .optional()?;
        match base {
            Some(mut p) => {
                self.load_provider_children(&mut p)?;
                Ok(Some(p))
            }
            None => Ok(None),
        }
    }

    pub fn provider_exists(&self, provider_id: &str) -> MatchResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM provider WHERE provider_id = ?1",
            params![provider_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// Active providers offering `query.service`, ordered by id.
    pub fn find_providers(&self, query: &ProviderQuery) -> MatchResult<Vec<Provider>> {
        let mut sql = String::from(
            "SELECT p.provider_id
             FROM provider p
             JOIN provider_service s ON s.provider_id = p.provider_id
             WHERE s.service = ?1 AND p.active = 1 AND (?2 = 0 OR p.eco_friendly = 1)",
        );
        let mut values: Vec<Value> = vec![
            Value::Text(query.service.clone()),
            Value::Integer(query.eco_only as i64),
        ];
        if let Some(ids) = &query.ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND p.provider_id IN ({})", placeholders(3, ids.len())));
            values.extend(ids.iter().cloned().map(Value::Text));
        }
        sql.push_str(" ORDER BY p.provider_id");

        let ids: Vec<String> = {
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |r| r.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut providers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.get_provider(&id)? {
                providers.push(p);
            }
        }
        Ok(providers)
    }

    fn load_provider_children(&self, p: &mut Provider) -> MatchResult<()> {
        let mut stmt = self.conn.prepare(
            "SELECT service FROM provider_service WHERE provider_id = ?1 ORDER BY service",
        )?;
        p.services = stmt
            .query_map(params![p.id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT kind, value FROM provider_zone WHERE provider_id = ?1 ORDER BY kind, value",
        )?;
        let zones = stmt
            .query_map(params![p.id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        p.service_zones.clear();
        p.areas.clear();
        for (kind, value) in zones {
            if kind == "zone" {
                p.service_zones.push(value);
            } else {
                p.areas.push(value);
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT weekday, start_minute, end_minute, timezone, active
             FROM availability_slot WHERE provider_id = ?1 ORDER BY id",
        )?;
        p.slots = stmt
            .query_map(params![p.id], |r| {
                Ok(AvailabilitySlot {
                    weekday: r.get(0)?,
                    start_minute: r.get(1)?,
                    end_minute: r.get(2)?,
                    timezone: r.get(3)?,
                    active: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT start_at, end_at FROM time_off WHERE provider_id = ?1 ORDER BY start_at",
        )?;
        p.time_off = stmt
            .query_map(params![p.id], |r| {
                Ok(TimeOffPeriod {
                    start: from_epoch(r.get(0)?),
                    end: from_epoch(r.get(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    pub fn has_time_off_overlap(&self, provider_id: &str, window: &TimeWindow) -> MatchResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM time_off
             WHERE provider_id = ?1 AND start_at < ?2 AND end_at > ?3",
            params![provider_id, to_epoch(window.end), to_epoch(window.start)],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    // ── History ───────────────────────────────────────────────────

    pub fn provider_stats(
        &self,
        provider_id: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
        window_days: i64,
    ) -> MatchResult<ProviderStats> {
        let since = now - Duration::days(window_days);
        let (recent, cancelled): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END), 0)
             FROM assignment
             WHERE provider_id = ?1 AND start_at >= ?2 AND start_at < ?3",
            params![provider_id, to_epoch(since), to_epoch(now)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM assignment WHERE provider_id = ?1 AND status != 'cancelled'",
            params![provider_id],
            |r| r.get(0),
        )?;
        let served_client = match client_id {
            Some(client) => {
                let n: i64 = self.conn.query_row(
                    "SELECT COUNT(*) FROM assignment a
                     JOIN job j ON j.job_id = a.job_id
                     WHERE a.provider_id = ?1 AND j.client_id = ?2 AND a.status = 'completed'",
                    params![provider_id, client],
                    |r| r.get(0),
                )?;
                n > 0
            }
            None => false,
        };
        let forward: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM assignment
                 WHERE provider_id = ?1 AND start_at >= ?2 AND status IN ({BLOCKING_STATUSES})"
            ),
            params![provider_id, to_epoch(now)],
            |r| r.get(0),
        )?;
        Ok(ProviderStats {
            recent_assignments: recent as u32,
            recent_cancellations: cancelled as u32,
            total_assignments: total as u32,
            served_client,
            forward_load: forward as u32,
        })
    }
}
