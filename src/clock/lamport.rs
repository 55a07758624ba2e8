// Lamport Clock
//
// A process-local counter implementing Lamport's two rules:
// - every local event ticks the clock
// - every received timestamp t moves the clock to max(clock, t) + 1
//
// The clock carries no lock of its own. It lives inside the mutex
// coordinator's state and is only touched under that lock.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic logical clock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalClock(u64);

impl LogicalClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self(0)
    }

    /// Create a clock starting at a given value
    pub fn starting_at(value: u64) -> Self {
        Self(value)
    }

    /// Current value without advancing
    pub fn now(&self) -> u64 {
        self.0
    }

    /// Advance for a local event and return the new value
    pub fn tick(&mut self) -> u64 {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    /// Merge a timestamp received from a peer and return the new value
    pub fn observe(&mut self, timestamp: u64) -> u64 {
        self.0 = self.0.max(timestamp).saturating_add(1);
        self.0
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
