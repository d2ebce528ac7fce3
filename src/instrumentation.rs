//! Observational metrics.
//!
//! Grounded on the teacher crate's `instrumentation::METRICS` singleton, but
//! scoped to one [`EngineMetrics`] per engine instance rather than a
//! process-global: a process hosting several replicas (simulation tests, in
//! particular) should not have them clobber each other's counters.
//!
//! Never consulted for protocol decisions — purely observational, safe to
//! read from another thread while the dispatcher runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one engine instance. All increments are relaxed: ordering
/// between counters is not meaningful, only their eventual values are.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped_stale: AtomicU64,
    decisions_reached: AtomicU64,
    view_changes: AtomicU64,
    snapshots_installed: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_messages_sent(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_dropped_stale(&self) {
        self.messages_dropped_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self) {
        self.decisions_reached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_view_change(&self) {
        self.view_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_installed(&self) {
        self.snapshots_installed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped_stale(&self) -> u64 {
        self.messages_dropped_stale.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn decisions_reached(&self) -> u64 {
        self.decisions_reached.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn view_changes(&self) -> u64 {
        self.view_changes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshots_installed(&self) -> u64 {
        self.snapshots_installed.load(Ordering::Relaxed)
    }
}
