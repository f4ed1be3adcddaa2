//! Reconnection backoff.
//!
//! The delay grows linearly with the attempt number up to a ceiling, and
//! jumps straight to the ceiling when the peer is out of range.  Delays are
//! always clamped to the reconnection deadline.

use core::time::Duration;
use std::time::Instant;

use crate::config::SessionConfig;
use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    step: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(step: Duration, ceiling: Duration) -> Self {
        Self {
            step,
            ceiling: ceiling.max(step),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.reconnect_delay(), config.out_of_range_delay())
    }

    /// Delay before attempt `attempt + 1`, after attempt `attempt` failed.
    pub fn delay_after(&self, attempt: u32, failure: LinkError) -> Duration {
        if failure == LinkError::OutOfRange {
            return self.ceiling;
        }
        self.step.saturating_mul(attempt.max(1)).min(self.ceiling)
    }

    /// Never sleep past `deadline`.
    pub fn clamp(delay: Duration, now: Instant, deadline: Instant) -> Duration {
        delay.min(deadline.saturating_duration_since(now))
    }
}
