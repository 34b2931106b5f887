//! Consensus timing and batching parameters

use std::time::Duration;

/// Tunables for a [`RaftMember`](crate::core::RaftMember).
///
/// The election timeouts are deliberately long: connection liveness, not
/// heartbeat loss, is the primary leader-failure signal, so these are the
/// timeouts after a leader is already believed dead, and long values avoid
/// cycles of repeated failed elections.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout (default: 1000ms).
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 2000ms).
    pub election_timeout_max: Duration,
    /// How long a replication stream may stay quiet before an empty
    /// AppendEntries goes out (default: `election_timeout_min / 2`).
    pub heartbeat_interval: Duration,
    /// Upper bound on entries carried by one AppendEntries (default: 64).
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(500),
            max_entries_per_append: 64,
        }
    }
}

impl RaftConfig {
    /// Override the election timeout range. Callers shrinking the range
    /// for tests usually want to shrink `heartbeat_interval` with it.
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_entries_per_append(mut self, max: usize) -> Self {
        self.max_entries_per_append = max;
        self
    }

    /// Draw a random election timeout within the configured range.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heartbeat_is_half_the_minimum_timeout() {
        let config = RaftConfig::default();
        assert_eq!(config.heartbeat_interval * 2, config.election_timeout_min);
    }

    #[test]
    fn random_timeout_stays_in_range() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200));
        for _ in 0..50 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(100));
            assert!(t <= Duration::from_millis(200));
        }
    }
}
