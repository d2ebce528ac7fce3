//! The retransmitter (C4): periodic resend of unacked messages per
//! destination.
//!
//! Kept pure on purpose, like the role modules in [`crate::roles`]: instead
//! of holding a `Network` handle and pushing bytes itself, every operation
//! returns the `(destination, message)` pairs the dispatcher should hand to
//! the network. This keeps the resend policy unit-testable without a fake
//! transport and keeps "what to send" and "how to send it" separate, the
//! same separation `ReplicaOutput` draws between messages and effects in
//! the engine this design is grounded on.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::message::Message;
use crate::types::ReplicaId;

/// Identifies one registered resend slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetransmitHandle(u64);

struct Slot {
    message: Message,
    remaining: HashSet<ReplicaId>,
    due_at_ms: u64,
}

/// Maintains one resend slot per outstanding `(message, destination-set)`.
///
/// Guarantee: while a destination remains in a slot's set, the message is
/// re-offered (via [`Retransmitter::tick`]) at least once every `period`
/// until the destination (or the whole slot) is stopped.
pub struct Retransmitter {
    period_ms: u64,
    slots: HashMap<u64, Slot>,
    next_id: u64,
}

impl Retransmitter {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: period.as_millis() as u64,
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers a new slot for `message` against `dests`, returning the
    /// handle and the immediate send to every destination.
    pub fn start_transmitting(
        &mut self,
        message: Message,
        dests: impl IntoIterator<Item = ReplicaId>,
        now_ms: u64,
    ) -> (RetransmitHandle, Vec<(ReplicaId, Message)>) {
        let remaining: HashSet<ReplicaId> = dests.into_iter().collect();
        let sends: Vec<_> = remaining.iter().map(|d| (*d, message.clone())).collect();

        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                message,
                remaining,
                due_at_ms: now_ms + self.period_ms,
            },
        );

        (RetransmitHandle(id), sends)
    }

    /// Removes a single destination from a slot. The slot is dropped once
    /// its destination set is empty.
    pub fn stop_destination(&mut self, handle: RetransmitHandle, dest: ReplicaId) {
        if let Some(slot) = self.slots.get_mut(&handle.0) {
            slot.remaining.remove(&dest);
            if slot.remaining.is_empty() {
                self.slots.remove(&handle.0);
            }
        }
    }

    /// Cancels an entire slot regardless of which destinations remain.
    pub fn stop(&mut self, handle: RetransmitHandle) {
        self.slots.remove(&handle.0);
    }

    /// Cancels every slot (used on leader loss / `stopProposer`).
    pub fn stop_all(&mut self) {
        self.slots.clear();
    }

    /// Forces an immediate extra send to the remaining destinations of
    /// `handle`, without waiting for the next tick's deadline.
    pub fn force_retransmit(&mut self, handle: RetransmitHandle) -> Vec<(ReplicaId, Message)> {
        match self.slots.get(&handle.0) {
            Some(slot) => slot
                .remaining
                .iter()
                .map(|d| (*d, slot.message.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Advances logical time to `now_ms`, resending every slot whose
    /// deadline has passed and rescheduling it one period out.
    pub fn tick(&mut self, now_ms: u64) -> Vec<(ReplicaId, Message)> {
        let mut sends = Vec::new();
        for slot in self.slots.values_mut() {
            if now_ms >= slot.due_at_ms {
                sends.extend(slot.remaining.iter().map(|d| (*d, slot.message.clone())));
                slot.due_at_ms = now_ms + self.period_ms;
            }
        }
        sends
    }

    #[must_use]
    pub fn active_slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use crate::types::ViewNumber;

    fn alive(view: u64) -> Message {
        Message::new(ViewNumber::new(view), 0, MessagePayload::Alive(crate::message::Alive))
    }

    #[test]
    fn start_transmitting_sends_immediately_to_all() {
        let mut rt = Retransmitter::new(Duration::from_millis(1000));
        let (_handle, sends) = rt.start_transmitting(
            alive(0),
            [ReplicaId::new(0), ReplicaId::new(1)],
            0,
        );
        assert_eq!(sends.len(), 2);
    }

    #[test]
    fn tick_resends_only_after_period_elapses() {
        let mut rt = Retransmitter::new(Duration::from_millis(1000));
        let (_handle, _) = rt.start_transmitting(alive(0), [ReplicaId::new(0)], 0);
        assert!(rt.tick(500).is_empty());
        assert_eq!(rt.tick(1000).len(), 1);
        assert!(rt.tick(1500).is_empty());
        assert_eq!(rt.tick(2000).len(), 1);
    }

    #[test]
    fn stop_destination_shrinks_set_and_empties_slot() {
        let mut rt = Retransmitter::new(Duration::from_millis(1000));
        let (handle, _) =
            rt.start_transmitting(alive(0), [ReplicaId::new(0), ReplicaId::new(1)], 0);
        rt.stop_destination(handle, ReplicaId::new(0));
        assert_eq!(rt.tick(1000).len(), 1);
        rt.stop_destination(handle, ReplicaId::new(1));
        assert_eq!(rt.active_slot_count(), 0);
    }

    #[test]
    fn force_retransmit_does_not_wait_for_deadline() {
        let mut rt = Retransmitter::new(Duration::from_millis(1000));
        let (handle, _) = rt.start_transmitting(alive(0), [ReplicaId::new(0)], 0);
        let forced = rt.force_retransmit(handle);
        assert_eq!(forced.len(), 1);
    }

    #[test]
    fn stop_all_clears_every_slot() {
        let mut rt = Retransmitter::new(Duration::from_millis(1000));
        rt.start_transmitting(alive(0), [ReplicaId::new(0)], 0);
        rt.start_transmitting(alive(1), [ReplicaId::new(1)], 0);
        rt.stop_all();
        assert_eq!(rt.active_slot_count(), 0);
    }
}
