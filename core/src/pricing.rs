//! Pricing collaborator: optional price ceiling for the price-fit tiebreak.

use crate::config::PricingConfig;

pub trait PricingProvider: Send + Sync {
    /// Highest acceptable price for the job, if one can be estimated.
    fn price_ceiling(
        &self,
        surface_m2: Option<f64>,
        duration_hours: f64,
        eco: bool,
    ) -> anyhow::Result<Option<f64>>;
}

/// Rate-card estimate: `(base + per_m2 × surface) × hours`, eco surcharge on top.
pub struct RateCardPricing {
    config: PricingConfig,
}

impl RateCardPricing {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }
}

impl PricingProvider for RateCardPricing {
    fn price_ceiling(
        &self,
        surface_m2: Option<f64>,
        duration_hours: f64,
        eco: bool,
    ) -> anyhow::Result<Option<f64>> {
        if !duration_hours.is_finite() || duration_hours <= 0.0 {
            anyhow::bail!("duration must be positive, got {duration_hours}");
        }
        let hourly = self.config.base_hourly + self.config.per_m2_hourly * surface_m2.unwrap_or(0.0);
        let mut ceiling = hourly * duration_hours;
        if eco {
            ceiling *= self.config.eco_multiplier;
        }
        Ok(Some(ceiling))
    }
}

/// Pricing disabled: no ceiling, price-fit is neutral.
pub struct NoPricing;

impl PricingProvider for NoPricing {
    fn price_ceiling(&self, _: Option<f64>, _: f64, _: bool) -> anyhow::Result<Option<f64>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_card_applies_eco_surcharge() {
        let pricing = RateCardPricing::new(PricingConfig {
            base_hourly: 30.0,
            per_m2_hourly: 0.1,
            eco_multiplier: 1.5,
        });
        let plain = pricing.price_ceiling(Some(100.0), 2.0, false).unwrap().unwrap();
        let eco = pricing.price_ceiling(Some(100.0), 2.0, true).unwrap().unwrap();
        assert!((plain - 80.0).abs() < 1e-9);
        assert!((eco - 120.0).abs() < 1e-9);
    }
}
