//! The leader oracle / failure detector (C7): a ping-based liveness monitor
//! that decides when a replica should stop waiting for the current leader
//! and try to become leader of a later view.
//!
//! Like [`crate::retransmitter::Retransmitter`], this is driven by explicit
//! `now_ms` ticks rather than owning a timer thread — the dispatcher is the
//! only place time enters the picture (§5 of the design).

use crate::config::EngineConfig;
use crate::types::{ReplicaId, ViewNumber};

/// The oracle's view of whether it is time to suspect the leader or send a
/// heartbeat.
pub struct FailureDetector {
    replica_id: ReplicaId,
    group_size: usize,
    send_timeout_ms: u64,
    suspect_timeout_ms: u64,

    /// Last time any protocol message or `Alive` was observed from the
    /// current leader (or, initially, engine startup).
    last_heard_ms: u64,

    /// Last time this replica sent `Alive` as leader.
    last_sent_alive_ms: u64,

    /// The view this detector last reported a suspicion for, so a single
    /// sustained timeout only fires one transition (mirrors "exactly one
    /// `onNewLeaderElected` callback per view transition").
    last_suspected_view: Option<ViewNumber>,
}

impl FailureDetector {
    #[must_use]
    pub fn new(config: &EngineConfig, now_ms: u64) -> Self {
        Self {
            replica_id: config.replica_id,
            group_size: config.group_size,
            send_timeout_ms: config.send_timeout.as_millis() as u64,
            suspect_timeout_ms: config.suspect_leader_timeout.as_millis() as u64,
            last_heard_ms: now_ms,
            last_sent_alive_ms: now_ms,
            last_suspected_view: None,
        }
    }

    /// Records liveness evidence for `view`: any in-protocol message from
    /// the leader of `view`, or an explicit `Alive`, resets the suspicion
    /// timer.
    pub fn note_liveness(&mut self, now_ms: u64) {
        self.last_heard_ms = now_ms;
    }

    /// Called when the replica's view advances (by any means): clears the
    /// one-shot suspicion latch and resets the liveness clock so the new
    /// view gets a full timeout before being suspected in turn.
    pub fn note_view_advanced(&mut self, now_ms: u64) {
        self.last_heard_ms = now_ms;
        self.last_suspected_view = None;
    }

    /// If this replica is the leader of `current_view` and `send_timeout`
    /// has elapsed since its last `Alive`, returns true and resets the
    /// timer (caller should broadcast `Alive`).
    pub fn should_send_alive(&mut self, current_view: ViewNumber, now_ms: u64) -> bool {
        if current_view.leader(self.group_size) != self.replica_id {
            return false;
        }
        if now_ms.saturating_sub(self.last_sent_alive_ms) >= self.send_timeout_ms {
            self.last_sent_alive_ms = now_ms;
            true
        } else {
            false
        }
    }

    /// If no liveness evidence has been seen for `current_view` within
    /// `suspect_leader_timeout`, returns the next view this replica should
    /// try to become leader of (the smallest `v' > current_view` with
    /// `v' mod group_size == replica_id`). Returns `None` otherwise, and
    /// fires at most once per view (the "exactly one leader-change event
    /// per view transition" contract).
    pub fn tick(&mut self, current_view: ViewNumber, now_ms: u64) -> Option<ViewNumber> {
        if self.last_suspected_view == Some(current_view) {
            return None;
        }
        if now_ms.saturating_sub(self.last_heard_ms) < self.suspect_timeout_ms {
            return None;
        }

        self.last_suspected_view = Some(current_view);
        Some(next_view_for(current_view, self.replica_id, self.group_size))
    }
}

/// The smallest `v' > view` with `v' mod group_size == replica_id`.
///
/// Deliberately *not* `let mut v = view + 1; ...`'s off-by-two cousin: the
/// design flags the original source's `int newView = view++` as a likely
/// bug and calls for computing this directly instead of incrementing a
/// captured-then-mutated copy.
#[must_use]
pub fn next_view_for(view: ViewNumber, replica_id: ReplicaId, group_size: usize) -> ViewNumber {
    let view = view.as_u64();
    let replica_id = u64::from(replica_id.as_u8());
    let group_size = group_size as u64;

    let remainder = view % group_size;
    let delta = if replica_id > remainder {
        replica_id - remainder
    } else {
        group_size - (remainder - replica_id)
    };
    ViewNumber::new(view + delta)
}
