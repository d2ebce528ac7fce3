//! The replicated-service adapter boundary, consumed by the engine.
//!
//! The service itself — its request format, its duplicate-reply cache, its
//! on-disk representation — is explicitly out of scope. The engine only
//! needs to hand it contiguous decided requests in order and ask it to
//! checkpoint itself for the snapshot/catch-up subprotocol (C11).

use crate::types::InstanceId;

/// The deterministic state machine the engine replicates decisions into.
pub trait Service {
    /// Applies the request decided at `instance_id`, returning the reply
    /// bytes. Called in strictly ascending `instance_id` order (P3) — the
    /// Learner buffers out-of-order decisions until the prefix is
    /// contiguous, so this is never called with a gap.
    fn execute(&mut self, instance_id: InstanceId, request: &[u8]) -> Vec<u8>;

    /// Produces a checkpoint of the current service state, for the snapshot
    /// subprotocol.
    fn make_snapshot(&self) -> Vec<u8>;

    /// Replaces the service's state with a checkpoint received via
    /// catch-up.
    fn update_to_snapshot(&mut self, bytes: &[u8]);

    /// Notifies the service that `instance_id` has been applied, for
    /// bookkeeping (e.g. advancing a duplicate-reply cache watermark).
    fn instance_executed(&mut self, instance_id: InstanceId);
}
