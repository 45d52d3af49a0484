//! Tunables for the coordinator loop

use crate::error::CoordinatorError;
use std::time::Duration;

/// Default time between two reconciliation ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound on the delta handed to the advancer
pub const DEFAULT_MAX_DELTA: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long the loop waits between ticks
    pub tick_interval: Duration,
    /// Elapsed time passed to the advancer is capped to this value, so a
    /// stalled process does not produce one huge simulation step
    pub max_delta: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_delta: DEFAULT_MAX_DELTA,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_tick_interval(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            max_delta: DEFAULT_MAX_DELTA.max(tick_interval),
        }
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.tick_interval.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "tick interval must be greater than zero".to_string(),
            ));
        }
        if self.max_delta < self.tick_interval {
            return Err(CoordinatorError::InvalidConfig(format!(
                "max delta ({:?}) must not be shorter than the tick interval ({:?})",
                self.max_delta, self.tick_interval
            )));
        }
        Ok(())
    }
}
