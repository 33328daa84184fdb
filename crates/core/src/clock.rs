// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction for row timestamps, lag and election deadlines
//!
//! Rows carry wall-clock seconds (`tm`), while timers and lag windows use
//! a monotonic `Instant`. Both come from the same clock so tests can move
//! them together.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A clock that provides monotonic and wall time
pub trait Clock: Clone + Send + Sync + 'static {
    /// Monotonic instant for deadlines and lag windows
    fn now(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch, as stored in `Row::tm`
    fn wall(&self) -> f64;
}

/// Real system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct FakeTime {
    instant: Instant,
    wall: f64,
}

/// Fake clock for testing with controllable time
#[derive(Clone, Debug)]
pub struct FakeClock {
    current: Arc<Mutex<FakeTime>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(FakeTime {
                instant: Instant::now(),
                wall: 1_700_000_000.0,
            })),
        }
    }

    /// Advance both monotonic and wall time by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.instant += duration;
        current.wall += duration.as_secs_f64();
    }

    /// Set the wall clock to a specific number of seconds
    pub fn set_wall(&self, wall: f64) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.wall = wall;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).instant
    }

    fn wall(&self) -> f64 {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).wall
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
