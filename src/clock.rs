// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The single logical clock every component advances against (spec.md §2:
//! "advances all communication state deterministically on a single logical
//! clock"). Abstracting it behind a trait lets tests drive cyclic
//! publication, subscription timeouts and MD retransmission deterministically
//! instead of sleeping on real wall-clock time.

use std::sync::Mutex;
use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default clock, backed by `std::time::Instant`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock a test can advance by hand, with no dependency on real time
/// passing.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { now: Mutex::new(Instant::now()) }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonically() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(std::time::Duration::from_millis(100));
        assert!(clock.now() >= t0 + std::time::Duration::from_millis(100));
    }
}
