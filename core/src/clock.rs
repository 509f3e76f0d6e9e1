//! Engine clock: the single source of "now".
//!
//! RULE: Nothing in the engine calls `Utc::now()` directly.
//! Lock TTLs, cache expiry and sweep staleness all read the injected
//! clock, so tests advance time instead of sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { current: Mutex::new(start) }
    }

    pub fn set(&self, ts: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = ts;
    }

    /// Move time forward. Returns the new instant.
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
        *guard
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
