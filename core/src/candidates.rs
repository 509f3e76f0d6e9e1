//! Candidate Filter.
//!
//! Stage order:
//!   1. store query: service, active flag, eco flag, explicit id set
//!   2. geography → synthetic distance
//!   3. drop overlapping time-off
//!   4. drop conflicting blocking assignments
//!   5. drop providers held by another job's live provider lock
//!   6. availability resolution
//!   7. forward load from future blocking assignments
//!
//! An empty result is a normal outcome, never an error.

use crate::{
    availability::{self, AvailabilityTier},
    config::MatchConfig,
    error::MatchResult,
    model::{Job, Provider},
    store::{MatchStore, ProviderQuery, ProviderStats},
    types::{ClientId, JobId, ProviderId, TimeWindow},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a job needs from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub service:             String,
    pub eco_required:        bool,
    pub window:              TimeWindow,
    pub city:                Option<String>,
    pub postal_code:         Option<String>,
    pub client_id:           Option<ClientId>,
    /// The job being (re)matched; its own assignments and locks never conflict.
    pub exclude_job_id:      Option<JobId>,
    pub provider_ids:        Option<Vec<ProviderId>>,
    pub required_members:    u32,
    pub price_ceiling:       Option<f64>,
    /// Pricing input when no explicit ceiling is given.
    pub surface_m2:          Option<f64>,
    /// Keep tier-0 / infinite-load candidates (eligibility-only checks).
    pub include_unavailable: bool,
}

impl MatchCriteria {
    pub fn new(service: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            service: service.into(),
            eco_required: false,
            window,
            city: None,
            postal_code: None,
            client_id: None,
            exclude_job_id: None,
            provider_ids: None,
            required_members: 1,
            price_ceiling: None,
            surface_m2: None,
            include_unavailable: false,
        }
    }

    /// Rebuild criteria from a persisted job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            service: job.service.clone(),
            eco_required: job.eco_preference,
            window: job.window(),
            city: job.city.clone(),
            postal_code: job.postal_code.clone(),
            client_id: Some(job.client_id.clone()),
            exclude_job_id: Some(job.id.clone()),
            provider_ids: None,
            required_members: job.required_members,
            price_ceiling: None,
            surface_m2: job.surface_m2,
            include_unavailable: false,
        }
    }

    pub fn restricted_to(mut self, ids: &[ProviderId]) -> Self {
        self.provider_ids = Some(ids.to_vec());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider:    Provider,
    pub tier:        AvailabilityTier,
    pub distance_km: f64,
    /// Forward blocking assignments plus the slot-time ratio.
    pub load:        f64,
    pub stats:       ProviderStats,
}

fn same_place(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Synthetic distance: exact service zone → 0, area match → half,
/// otherwise the full `max_km`. No city means everyone is local.
pub fn geo_distance(provider: &Provider, city: Option<&str>, postal_code: Option<&str>, max_km: f64) -> f64 {
    let Some(city) = city.filter(|c| !c.trim().is_empty()) else {
        return 0.0;
    };
    let zone_hit = provider.service_zones.iter().any(|z| {
        same_place(z, city) || postal_code.is_some_and(|pc| same_place(z, pc))
    });
    if zone_hit {
        return 0.0;
    }
    let needle = city.trim().to_lowercase();
    let area_hit = provider.areas.iter().any(|a| {
        let area = a.trim().to_lowercase();
        !area.is_empty() && (area.contains(&needle) || needle.contains(&area))
    });
    if area_hit {
        max_km / 2.0
    } else {
        max_km
    }
}

pub struct CandidateFilter<'a> {
    store:  &'a MatchStore,
    config: &'a MatchConfig,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(store: &'a MatchStore, config: &'a MatchConfig) -> Self {
        Self { store, config }
    }

    pub fn candidates(&self, criteria: &MatchCriteria, now: DateTime<Utc>) -> MatchResult<Vec<Candidate>> {
        let providers = self.store.find_providers(&ProviderQuery {
            service: criteria.service.clone(),
            eco_only: criteria.eco_required,
            ids: criteria.provider_ids.clone(),
        })?;
        let queried = providers.len();
        let window = &criteria.window;
        let exclude_job = criteria.exclude_job_id.as_deref();

        let mut out = Vec::with_capacity(providers.len());
        for provider in providers {
            let distance_km = geo_distance(
                &provider,
                criteria.city.as_deref(),
                criteria.postal_code.as_deref(),
                self.config.scoring.max_distance_km,
            );
            if availability::time_off_overlaps(&provider.time_off, window) {
                continue;
            }
            if self.store.has_conflicting_assignment(&provider.id, window, exclude_job)? {
                continue;
            }
            if self.store.provider_has_active_lock(&provider.id, window, now, exclude_job)? {
                continue;
            }
            let coverage = availability::resolve(
                &provider.slots,
                &provider.time_off,
                window,
                self.config.availability.buffer_minutes,
            );
            let stats = self.store.provider_stats(
                &provider.id,
                criteria.client_id.as_deref(),
                now,
                self.config.scoring.reliability_window_days,
            )?;
            let load = stats.forward_load as f64 + coverage.load;
            let usable = coverage.tier.is_available() && load.is_finite();
            if !usable && !criteria.include_unavailable {
                continue;
            }
            out.push(Candidate {
                provider,
                tier: coverage.tier,
                distance_km,
                load,
                stats,
            });
        }
        log::debug!(
            "candidates: service={} queried={queried} kept={}",
            criteria.service,
            out.len()
        );
        Ok(out)
    }
}
