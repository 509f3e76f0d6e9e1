//! Hot-reloadable scoring weights.
//!
//! The configuration source is read at most once per TTL; between
//! refreshes every caller sees the same cached mapping. Time comes from
//! the injected clock.

use crate::{
    clock::Clock,
    config::ScoringWeights,
    error::MatchResult,
    store::MatchStore,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Setting key holding a JSON-encoded `ScoringWeights`.
pub const WEIGHTS_SETTING_KEY: &str = "scoring_weights";

/// Supplies operator-tuned weights. `Ok(None)` means "nothing
/// configured, use defaults".
pub trait WeightSource: Send + Sync {
    fn load_weights(&self) -> MatchResult<Option<ScoringWeights>>;
}

/// Reads weights from the `setting` table through its own connection.
pub struct StoreWeightSource {
    store: Mutex<MatchStore>,
}

impl StoreWeightSource {
    pub fn new(store: MatchStore) -> Self {
        Self { store: Mutex::new(store) }
    }
}

impl WeightSource for StoreWeightSource {
    fn load_weights(&self) -> MatchResult<Option<ScoringWeights>> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match store.get_setting(WEIGHTS_SETTING_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Fixed weights, for tests and embedded use.
pub struct StaticWeightSource(pub Option<ScoringWeights>);

impl WeightSource for StaticWeightSource {
    fn load_weights(&self) -> MatchResult<Option<ScoringWeights>> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    value:      ScoringWeights,
    expires_at: DateTime<Utc>,
}

pub struct WeightCache {
    source:   Box<dyn WeightSource>,
    clock:    Arc<dyn Clock>,
    ttl:      Duration,
    defaults: ScoringWeights,
    cached:   Mutex<Option<Cached>>,
}

impl WeightCache {
    pub fn new(
        source: Box<dyn WeightSource>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        defaults: ScoringWeights,
    ) -> Self {
        Self { source, clock, ttl, defaults, cached: Mutex::new(None) }
    }

    /// Current raw (un-normalized) weights.
    pub fn current(&self) -> ScoringWeights {
        let now = self.clock.now();
        let mut guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = *guard {
            if now < c.expires_at {
                return c.value;
            }
        }
        let value = match self.source.load_weights() {
            Ok(Some(w)) => w,
            Ok(None) => self.defaults,
            Err(e) => {
                log::warn!("weights: source failed, using defaults: {e}");
                self.defaults
            }
        };
        log::debug!("weights: refreshed, next refresh after {}s", self.ttl.num_seconds());
        *guard = Some(Cached { value, expires_at: now + self.ttl });
        value
    }

    /// Drop the cached value so the next read hits the source.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: Arc<AtomicU32>,
    }

    impl WeightSource for CountingSource {
        fn load_weights(&self) -> MatchResult<Option<ScoringWeights>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ScoringWeights { distance: n as f64 + 1.0, ..ScoringWeights::default() }))
        }
    }

    #[test]
    fn refreshes_only_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let calls = Arc::new(AtomicU32::new(0));
        let cache = WeightCache::new(
            Box::new(CountingSource { calls: calls.clone() }),
            clock.clone(),
            Duration::seconds(60),
            ScoringWeights::default(),
        );

        assert_eq!(cache.current().distance, 1.0);
        clock.advance(Duration::seconds(59));
        assert_eq!(cache.current().distance, 1.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.current().distance, 2.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_source_yields_defaults() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let cache = WeightCache::new(
            Box::new(StaticWeightSource(None)),
            clock,
            Duration::seconds(60),
            ScoringWeights::default(),
        );
        assert_eq!(cache.current(), ScoringWeights::default());
    }
}
