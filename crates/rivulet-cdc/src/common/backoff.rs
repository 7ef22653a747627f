//! Adaptive poll interval
//!
//! Grows on empty polls, snaps back to the floor when changes show up.

use std::time::Duration;

/// Poll interval controller owned by a single table monitor.
#[derive(Debug, Clone)]
pub struct BackoffController {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl BackoffController {
    /// Create a controller starting at `floor`.
    ///
    /// A floor above the ceiling is clamped to the ceiling.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let floor = floor.min(ceiling);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Interval to wait before the next poll
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the floor after activity
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Double the interval, capped at the ceiling
    pub fn increase(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.ceiling);
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
