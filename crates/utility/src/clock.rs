use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Source of simulated time. The whole system compares timestamps through an
/// injected clock, never through `Utc::now()` directly, so tests and the
/// simulation master can drive time at any rate.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Plain wall clock.
#[derive(Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Simulated clock that advances at `multiplier` times real speed starting
/// from `epoch`. A multiplier below 1.0 slows the simulation down.
#[derive(Debug)]
pub struct SimulatedClock {
    epoch: DateTime<Utc>,
    started: Instant,
    multiplier: f64,
}

impl SimulatedClock {
    pub fn new(epoch: DateTime<Utc>, multiplier: f64) -> Self {
        Self {
            epoch,
            started: Instant::now(),
            multiplier,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let real_elapsed = self.started.elapsed();
        let sim_millis = real_elapsed.as_millis() as f64 * self.multiplier;
        self.epoch + Duration::milliseconds(sim_millis as i64)
    }
}

/// Clock that only moves when told to. Used by tests to step through
/// schedules deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
