//! Engine configuration.
//!
//! A single immutable value constructed once at engine startup. There is no
//! hot reload and no file loading here — that belongs to the CLI/config
//! layer this core is deliberately decoupled from.

use std::time::Duration;

use crate::types::ReplicaId;

/// Immutable configuration for one replica's engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub replica_id: ReplicaId,
    pub group_size: usize,

    /// Maximum number of simultaneously in-flight proposal ids.
    pub window_size: usize,

    pub max_udp_packet_size: usize,
    pub batch_size: usize,
    pub busy_threshold: usize,

    pub retransmit_timeout: Duration,
    pub send_timeout: Duration,
    pub suspect_leader_timeout: Duration,

    pub snapshot_min_log_size: usize,
    pub snapshot_ask_ratio: f64,
    pub snapshot_force_ratio: f64,

    pub catchup_min_resend_timeout: Duration,
    pub periodic_catchup_timeout: Duration,
}

impl EngineConfig {
    /// Builds the default configuration from §6/§4 of the design for a
    /// group of `group_size` replicas, with this process acting as
    /// `replica_id`.
    #[must_use]
    pub fn new(replica_id: ReplicaId, group_size: usize) -> Self {
        assert!(group_size > 0, "group_size must be non-zero");
        assert!(
            (replica_id.as_u8() as usize) < group_size,
            "replica_id must be within the group"
        );

        let max_udp_packet_size = 1472;
        Self {
            replica_id,
            group_size,
            window_size: 1,
            max_udp_packet_size,
            batch_size: max_udp_packet_size,
            busy_threshold: 10_240,
            retransmit_timeout: Duration::from_millis(1000),
            send_timeout: Duration::from_millis(1000),
            suspect_leader_timeout: Duration::from_millis(2000),
            snapshot_min_log_size: 64 * 1024,
            snapshot_ask_ratio: 1.5,
            snapshot_force_ratio: 3.0,
            catchup_min_resend_timeout: Duration::from_millis(50),
            periodic_catchup_timeout: Duration::from_millis(2000),
        }
    }

    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        assert!(window_size > 0, "window_size must be non-zero");
        self.window_size = window_size;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size >= 4, "batch_size must fit the count prefix");
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_busy_threshold(mut self, busy_threshold: usize) -> Self {
        self.busy_threshold = busy_threshold;
        self
    }

    #[must_use]
    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_suspect_leader_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_leader_timeout = timeout;
        self
    }

    #[must_use]
    pub fn quorum_size(&self) -> usize {
        crate::types::quorum_size(self.group_size)
    }

    /// The first-ever snapshot size estimate, used before any snapshot has
    /// been taken.
    #[must_use]
    pub const fn initial_snapshot_estimate_bytes() -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_constants() {
        let cfg = EngineConfig::new(ReplicaId::new(0), 3);
        assert_eq!(cfg.window_size, 1);
        assert_eq!(cfg.max_udp_packet_size, 1472);
        assert_eq!(cfg.batch_size, 1472);
        assert_eq!(cfg.busy_threshold, 10_240);
        assert_eq!(cfg.quorum_size(), 2);
    }

    #[test]
    #[should_panic(expected = "replica_id must be within the group")]
    fn rejects_replica_id_outside_group() {
        EngineConfig::new(ReplicaId::new(5), 3);
    }
}
