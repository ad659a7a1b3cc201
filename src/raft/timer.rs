use rand::Rng;
use std::time::Duration;

use crate::config::RaftConfig;

/// Picks a fresh election timeout, uniform in `[min, max)` of the config.
pub fn random_election_timeout(config: &RaftConfig) -> Duration {
    let (min_ms, max_ms) = (config.election_timeout_min_ms, config.election_timeout_max_ms);
    if min_ms >= max_ms {
        return Duration::from_millis(min_ms);
    }
    let timeout_ms = rand::thread_rng().gen_range(min_ms..max_ms);
    Duration::from_millis(timeout_ms)
}
