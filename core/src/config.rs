//! Engine configuration.
//!
//! Every field has a default so a missing or partial `matching.json`
//! still yields a usable engine. Scoring weights can additionally be
//! hot-reloaded from the store (see `weights.rs`); the values here are
//! the fallback.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub distance:     f64,
    pub rating:       f64,
    pub reliability:  f64,
    pub experience:   f64,
    pub eco:          f64,
    pub availability: f64,
    pub loyalty:      f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            distance:     0.20,
            rating:       0.20,
            reliability:  0.15,
            experience:   0.10,
            eco:          0.15,
            availability: 0.15,
            loyalty:      0.05,
        }
    }
}

impl ScoringWeights {
    fn as_array(&self) -> [f64; 7] {
        [
            self.distance,
            self.rating,
            self.reliability,
            self.experience,
            self.eco,
            self.availability,
            self.loyalty,
        ]
    }

    fn from_array(w: [f64; 7]) -> Self {
        Self {
            distance:     w[0],
            rating:       w[1],
            reliability:  w[2],
            experience:   w[3],
            eco:          w[4],
            availability: w[5],
            loyalty:      w[6],
        }
    }

    /// Re-normalize so the weights sum to 1.
    ///
    /// Negative and non-finite entries count as zero. When eco is not a
    /// requirement its weight is dropped and the rest scale up
    /// proportionally. A degenerate mapping falls back to the defaults.
    pub fn normalized(&self, eco_required: bool) -> Self {
        let mut w = self.as_array().map(|v| if v.is_finite() && v > 0.0 { v } else { 0.0 });
        if !eco_required {
            w[4] = 0.0;
        }
        let sum: f64 = w.iter().sum();
        if sum <= f64::EPSILON {
            return ScoringWeights::default().normalized(eco_required);
        }
        Self::from_array(w.map(|v| v / sum))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Synthetic distance unit assigned to a full geographic miss.
    pub max_distance_km: f64,
    /// Bonus for company candidates when three or more workers are needed.
    pub team_bonus_large: f64,
    /// Bonus for company candidates when exactly two workers are needed.
    pub team_bonus_pair: f64,
    pub weights_cache_ttl_secs: i64,
    /// Assignment count at which the experience component saturates.
    pub experience_saturation: u32,
    pub reliability_window_days: i64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            max_distance_km: 20.0,
            team_bonus_large: 0.05,
            team_bonus_pair: 0.02,
            weights_cache_ttl_secs: 60,
            experience_saturation: 200,
            reliability_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub buffer_minutes: i64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self { buffer_minutes: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_minutes: i64,
    pub min_ttl_minutes: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { default_ttl_minutes: 15, min_ttl_minutes: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_retries: u32,
    /// Jobs touched more recently than this are left alone by the retry sweep.
    pub stale_after_minutes: i64,
    pub expired_lock_batch: u32,
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stale_after_minutes: 5,
            expired_lock_batch: 25,
            interval_secs: 60,
        }
    }
}

/// Rate card for the built-in pricing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub base_hourly: f64,
    pub per_m2_hourly: f64,
    pub eco_multiplier: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self { base_hourly: 35.0, per_m2_hourly: 0.05, eco_multiplier: 1.15 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub scoring:      ScoringConfig,
    pub availability: AvailabilityConfig,
    pub locks:        LockConfig,
    pub scheduler:    SchedulerConfig,
    pub pricing:      PricingConfig,
}

impl MatchConfig {
    /// Load from the data/ directory.
    /// In tests, use MatchConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/matching.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: MatchConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        if config.locks.min_ttl_minutes < 1 {
            anyhow::bail!("{path}: locks.min_ttl_minutes must be at least 1");
        }
        if config.scoring.max_distance_km <= 0.0 {
            anyhow::bail!("{path}: scoring.max_distance_km must be positive");
        }
        Ok(config)
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let w = ScoringWeights::default().normalized(true);
        let sum = w.distance + w.rating + w.reliability + w.experience
            + w.eco + w.availability + w.loyalty;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn eco_weight_redistributed_when_not_required() {
        let w = ScoringWeights::default().normalized(false);
        assert_eq!(w.eco, 0.0);
        // 0.20 / 0.85
        assert!((w.distance - 0.20 / 0.85).abs() < 1e-9);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: MatchConfig =
            serde_json::from_str(r#"{"scheduler": {"max_retries": 5}}"#).unwrap();
        assert_eq!(cfg.scheduler.max_retries, 5);
        assert_eq!(cfg.scheduler.expired_lock_batch, 25);
        assert_eq!(cfg.locks.default_ttl_minutes, 15);
    }

    #[test]
    fn zeroed_weights_fall_back_to_defaults() {
        let zero = ScoringWeights {
            distance: 0.0, rating: 0.0, reliability: 0.0, experience: 0.0,
            eco: 0.0, availability: 0.0, loyalty: 0.0,
        };
        assert_eq!(zero.normalized(true), ScoringWeights::default().normalized(true));
    }
}
