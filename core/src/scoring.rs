//! Scoring Engine: weighted multi-factor score with an explainable
//! breakdown and a total, deterministic ordering.
//!
//! RULE: every component lives in [0, 1].
//! RULE: no randomness anywhere; the final tiebreak is the provider id.

use crate::{
    availability::AvailabilityTier,
    candidates::{Candidate, MatchCriteria},
    config::{ScoringConfig, ScoringWeights},
    model::ProviderKind,
    types::ProviderId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub distance:     f64,
    pub rating:       f64,
    pub reliability:  f64,
    pub experience:   f64,
    pub eco:          f64,
    pub availability: f64,
    pub loyalty:      f64,
}

impl ScoreComponents {
    pub fn weighted(&self, w: &ScoringWeights) -> f64 {
        self.distance * w.distance
            + self.rating * w.rating
            + self.reliability * w.reliability
            + self.experience * w.experience
            + self.eco * w.eco
            + self.availability * w.availability
            + self.loyalty * w.loyalty
    }
}

/// One ranked row of a preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub provider_id:     ProviderId,
    pub kind:            ProviderKind,
    /// 1-based.
    pub rank:            u32,
    pub score:           f64,
    pub components:      ScoreComponents,
    pub team_bonus:      f64,
    pub tier:            AvailabilityTier,
    pub distance_km:     f64,
    pub load:            f64,
    pub rating_average:  f64,
    pub estimated_price: f64,
    pub price_fit:       f64,
}

// ── Components ───────────────────────────────────────────────────────────────

pub fn components(c: &Candidate, criteria: &MatchCriteria, config: &ScoringConfig) -> ScoreComponents {
    let max_km = config.max_distance_km;
    let distance = if max_km > 0.0 {
        1.0 - (c.distance_km / max_km).min(1.0)
    } else {
        1.0
    };

    let s = &c.stats;
    let reliability = if s.recent_assignments == 0 {
        1.0
    } else {
        let ratio = s.recent_cancellations as f64 / s.recent_assignments as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    };
    let experience = if config.experience_saturation == 0 {
        1.0
    } else {
        (s.total_assignments as f64 / config.experience_saturation as f64).min(1.0)
    };
    let eco = if !criteria.eco_required || c.provider.eco_friendly { 1.0 } else { 0.0 };

    ScoreComponents {
        distance: distance.clamp(0.0, 1.0),
        rating: (c.provider.rating_average / 5.0).clamp(0.0, 1.0),
        reliability,
        experience,
        eco,
        availability: c.tier.value(),
        loyalty: if s.served_client { 0.5 } else { 0.0 },
    }
}

/// Flat bonus for companies on multi-worker jobs.
pub fn team_bonus(kind: ProviderKind, required_members: u32, config: &ScoringConfig) -> f64 {
    if kind != ProviderKind::Company || required_members <= 1 {
        return 0.0;
    }
    if required_members >= 3 {
        config.team_bonus_large
    } else {
        config.team_bonus_pair
    }
}

pub fn price_fit(ceiling: Option<f64>, estimated_price: f64) -> f64 {
    match ceiling {
        Some(ceil) if ceil > 0.0 => ((ceil - estimated_price) / ceil).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────────

/// score ↓, tier ↓, rating ↓, reliability ↓, distance ↑, price-fit ↓, id ↑.
pub fn compare(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.tier.cmp(&a.tier))
        .then_with(|| b.rating_average.total_cmp(&a.rating_average))
        .then_with(|| b.components.reliability.total_cmp(&a.components.reliability))
        .then_with(|| a.distance_km.total_cmp(&b.distance_km))
        .then_with(|| b.price_fit.total_cmp(&a.price_fit))
        .then_with(|| a.provider_id.cmp(&b.provider_id))
}

/// Score, drop, sort and number the candidates. `weights` are the raw
/// (un-normalised) weights; eco redistribution happens here.
pub fn rank(
    candidates: &[Candidate],
    criteria: &MatchCriteria,
    weights: &ScoringWeights,
    config: &ScoringConfig,
) -> Vec<ScoredCandidate> {
    let w = weights.normalized(criteria.eco_required);
    let hours = criteria.window.duration_hours();

    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .filter_map(|c| {
            let comps = components(c, criteria, config);
            if comps.availability <= 0.0 || (criteria.eco_required && comps.eco <= 0.0) {
                return None;
            }
            let bonus = team_bonus(c.provider.kind, criteria.required_members, config);
            let estimated_price = c.provider.hourly_rate * hours;
            Some(ScoredCandidate {
                provider_id: c.provider.id.clone(),
                kind: c.provider.kind,
                rank: 0,
                score: comps.weighted(&w) + bonus,
                components: comps,
                team_bonus: bonus,
                tier: c.tier,
                distance_km: c.distance_km,
                load: c.load,
                rating_average: c.provider.rating_average,
                estimated_price,
                price_fit: price_fit(criteria.price_ceiling, estimated_price),
            })
        })
        .collect();

    scored.sort_by(compare);
    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i as u32 + 1;
    }
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bonus_only_for_companies_on_team_jobs() {
        let cfg = ScoringConfig::default();
        assert_eq!(team_bonus(ProviderKind::Individual, 3, &cfg), 0.0);
        assert_eq!(team_bonus(ProviderKind::Company, 1, &cfg), 0.0);
        assert_eq!(team_bonus(ProviderKind::Company, 2, &cfg), cfg.team_bonus_pair);
        assert_eq!(team_bonus(ProviderKind::Company, 5, &cfg), cfg.team_bonus_large);
    }

    #[test]
    fn price_fit_is_clamped() {
        assert_eq!(price_fit(None, 50.0), 0.0);
        assert_eq!(price_fit(Some(100.0), 150.0), 0.0);
        assert!((price_fit(Some(100.0), 60.0) - 0.4).abs() < 1e-9);
        assert_eq!(price_fit(Some(100.0), -10.0), 1.0);
    }
}
