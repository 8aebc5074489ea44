//! Reconnection policy.
//!
//! Defines whether the link reconnects after losing the simulator and the
//! exponential backoff applied between attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Whether the link reconnects automatically after a transport failure.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay before the first attempt.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier applied after each failed attempt (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempts before the link gives up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

const fn default_enabled() -> bool {
    true
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay schedule: one entry per allowed attempt.
    #[must_use]
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            next: self.initial_delay.min(self.max_delay),
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            remaining: self.max_attempts,
        }
    }

    /// Computes the delay that follows `previous`.
    ///
    /// `next = min(previous * multiplier, max_delay)`.
    #[must_use]
    pub fn next_delay(&self, previous: Duration) -> Duration {
        scale_capped(previous, self.multiplier, self.max_delay)
    }
}

fn scale_capped(previous: Duration, multiplier: f64, max_delay: Duration) -> Duration {
    let secs = previous.as_secs_f64() * multiplier;
    if !secs.is_finite() || secs < 0.0 || secs >= max_delay.as_secs_f64() {
        return max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Iterator over reconnection delays.
///
/// Yields exactly `max_attempts` delays. The first is the initial delay
/// (capped), and each following one is the previous multiplied and capped.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    next: Duration,
    max_delay: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next;
        self.next = scale_capped(current, self.multiplier, self.max_delay);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for BackoffSchedule {}
