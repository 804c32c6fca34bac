//! Wall-clock helpers shared by the engine components.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Convert a configured `std` duration into a chrono delta, saturating.
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Elapsed time between two instants, zero if `later` precedes `earlier`.
pub fn elapsed(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
