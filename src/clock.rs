//! Timer source for pollers.
//!
//! Wraps Tokio's interval timer so every poller shares the same tick
//! semantics: the first tick lands one full cadence after creation, and
//! a stalled runtime never produces a burst of catch-up ticks.

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::controller::OverlapPolicy;
use crate::failure::PollError;

/// A validated, non-zero polling interval with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cadence {
    millis: u64,
}

impl Cadence {
    /// Interval used when the caller does not pick one.
    pub const DEFAULT: Cadence = Cadence { millis: 3000 };

    /// Create a cadence from milliseconds. Zero is rejected.
    pub fn from_millis(millis: u64) -> Result<Self, PollError> {
        if millis == 0 {
            return Err(PollError::ZeroInterval);
        }
        Ok(Self { millis })
    }

    /// Create a cadence from whole seconds. Zero is rejected.
    pub fn from_secs(secs: u64) -> Result<Self, PollError> {
        Self::from_millis(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.millis
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.millis)
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<Duration> for Cadence {
    type Error = PollError;

    /// Sub-millisecond precision is dropped, so anything under 1ms is rejected.
    fn try_from(duration: Duration) -> Result<Self, Self::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self::from_millis(millis)
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 == 0 {
            write!(f, "{}s", self.millis / 1000)
        } else {
            write!(f, "{}ms", self.millis)
        }
    }
}

/// Create the interval timer that drives a poller.
///
/// The first tick completes one cadence from now. Missed ticks are skipped
/// when the poller refuses overlap and delayed otherwise; neither mode
/// bursts.
pub fn ticker(cadence: Cadence, policy: OverlapPolicy) -> Interval {
    let period = cadence.as_duration();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(match policy {
        OverlapPolicy::SkipIfBusy => MissedTickBehavior::Skip,
        OverlapPolicy::Allow => MissedTickBehavior::Delay,
    });
    interval
}
