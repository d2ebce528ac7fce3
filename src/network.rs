//! The network boundary (C2), consumed by the engine.
//!
//! The wire transport itself — datagram vs. stream, retries at the socket
//! level, connection management — is explicitly out of scope; the core only
//! needs a way to hand a [`Message`] to a destination (or to everyone) and
//! have it show up on the other side's dispatcher queue.

use crate::message::Message;
use crate::types::ReplicaId;

/// Outbound half of the network boundary.
pub trait Network {
    /// Sends `msg` to a single replica.
    fn send_to(&mut self, dest: ReplicaId, msg: Message);

    /// Sends `msg` to every replica in `dests`.
    fn send_to_all(&mut self, dests: &[ReplicaId], msg: Message) {
        for dest in dests {
            self.send_to(*dest, msg.clone());
        }
    }
}
