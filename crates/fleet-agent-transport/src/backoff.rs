//! Randomized retry intervals.

use std::time::Duration;

use fleet_agent_core::RetryRange;
use rand::Rng;

/// Pick a random whole number of seconds within `range`.
#[must_use]
pub fn jittered(range: RetryRange) -> Duration {
    let (min, max) = if range.min_secs <= range.max_secs {
        (range.min_secs, range.max_secs)
    } else {
        (range.max_secs, range.min_secs)
    };
    Duration::from_secs(rand::thread_rng().gen_range(min..=max))
}
