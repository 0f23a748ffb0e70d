//! Restart backoff schedule
//!
//! Ramps 2s, 5s, 15s, 30s, then holds at 60s. A worker that stays healthy
//! long enough earns its way back to the start of the ladder.

use std::time::Duration;

const LADDER: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
];
const CAP: Duration = Duration::from_secs(60);

/// Healthy runtime after which the ladder resets.
pub const HEALTHY_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
pub struct RestartBackoff {
    failures: u32,
}

impl RestartBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next restart attempt, advancing the ladder.
    pub fn next_delay(&mut self) -> Duration {
        let delay = LADDER
            .get(self.failures as usize)
            .copied()
            .unwrap_or(CAP);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
