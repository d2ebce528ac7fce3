//! The replicated log: a dense run of [`ConsensusInstance`] slots.
//!
//! Entries below the snapshot watermark are discarded by [`Log::truncate_below`]
//! once the service has applied them; the log otherwise only grows by
//! [`Log::append`] (the proposer) or by gap-filling (the acceptor, on an
//! out-of-order `Propose`).

use std::collections::{HashSet, VecDeque};

use crate::types::{InstanceId, ReplicaId, ViewNumber};

/// Lifecycle state of a consensus instance (data model invariant 1/2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unknown,
    Known,
    Decided,
}

/// One slot in the replicated log.
///
/// Invariants enforced by [`ConsensusInstance::set_value`] rather than left
/// to callers: `state = Unknown` implies `value` is absent; `state = Decided`
/// implies `value` is present and immutable; `accepts` is dropped on
/// transition to `Decided` so invariant 2 (decided values are immutable) is
/// structural rather than convention.
#[derive(Debug, Clone)]
pub struct ConsensusInstance {
    pub id: InstanceId,
    view: Option<ViewNumber>,
    value: Option<Vec<u8>>,
    state: InstanceState,
    accepts: Option<HashSet<ReplicaId>>,
}

impl ConsensusInstance {
    /// A fresh, empty slot at `id` (the Acceptor's gap-filling shape).
    #[must_use]
    pub fn unknown(id: InstanceId) -> Self {
        Self {
            id,
            view: None,
            value: None,
            state: InstanceState::Unknown,
            accepts: None,
        }
    }

    /// A freshly appended slot, already `Known` (the Proposer's append shape).
    #[must_use]
    pub fn known(id: InstanceId, view: ViewNumber, value: Vec<u8>) -> Self {
        Self {
            id,
            view: Some(view),
            value: Some(value),
            state: InstanceState::Known,
            accepts: Some(HashSet::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    #[must_use]
    pub fn view(&self) -> Option<ViewNumber> {
        self.view
    }

    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    #[must_use]
    pub fn accepts(&self) -> Option<&HashSet<ReplicaId>> {
        self.accepts.as_ref()
    }

    pub fn is_decided(&self) -> bool {
        self.state == InstanceState::Decided
    }

    /// Applies the Paxos "accept highest-view value" rule (invariant 3):
    /// a lower view is a no-op, an equal view only overwrites an absent or
    /// byte-identical value, a higher view always overwrites.
    ///
    /// Returns `Err` if a higher or equal view's value conflicts with an
    /// already-decided value — that is a protocol violation, not a routine
    /// drop, since it means two proposals were accepted for the same
    /// (id, view) with different bytes.
    pub fn set_value(&mut self, new_view: ViewNumber, new_value: &[u8]) -> Result<(), String> {
        if self.state == InstanceState::Decided {
            if self.value.as_deref() == Some(new_value) {
                return Ok(());
            }
            return Err(format!(
                "instance {} already decided with a different value",
                self.id
            ));
        }

        match self.view {
            Some(v) if new_view < v => Ok(()), // stale proposal, no-op
            Some(v) if new_view == v => {
                match &self.value {
                    None => {
                        self.value = Some(new_value.to_vec());
                        self.state = InstanceState::Known;
                        Ok(())
                    }
                    Some(existing) if existing.as_slice() == new_value => Ok(()),
                    Some(_) => Err(format!(
                        "instance {} received conflicting values at the same view",
                        self.id
                    )),
                }
            }
            _ => {
                // New view is strictly higher than anything seen (or this
                // slot had never seen a proposal): overwrite per invariant 3.
                self.view = Some(new_view);
                self.value = Some(new_value.to_vec());
                self.state = InstanceState::Known;
                self.accepts = Some(HashSet::new());
                Ok(())
            }
        }
    }

    /// Records an Accept from `sender` for `view`. A higher view resets the
    /// accept set (invariant 6/P6); a lower view is ignored.
    pub fn record_accept(&mut self, view: ViewNumber, sender: ReplicaId) {
        if self.state == InstanceState::Decided {
            return;
        }
        match self.view {
            Some(v) if view < v => return,
            Some(v) if view > v => {
                self.view = Some(view);
                self.accepts = Some(HashSet::new());
            }
            None => {
                self.view = Some(view);
                self.accepts = Some(HashSet::new());
            }
            _ => {}
        }
        self.accepts.get_or_insert_with(HashSet::new).insert(sender);
    }

    #[must_use]
    pub fn accept_count(&self) -> usize {
        self.accepts.as_ref().map_or(0, HashSet::len)
    }

    /// Transitions to `Decided`, releasing the (no longer needed) accept set.
    pub fn mark_decided(&mut self) {
        self.state = InstanceState::Decided;
        self.accepts = None;
    }
}

/// The ordered, dense run of consensus instances `[first, next)`.
#[derive(Debug, Clone)]
pub struct Log {
    first: InstanceId,
    entries: VecDeque<ConsensusInstance>,
}

impl Log {
    #[must_use]
    pub fn new() -> Self {
        Self {
            first: InstanceId::ZERO,
            entries: VecDeque::new(),
        }
    }

    /// Restores a log whose ids begin at `first` (e.g. after installing a
    /// snapshot with `first = last_included_instance_id.next()`).
    #[must_use]
    pub fn starting_at(first: InstanceId) -> Self {
        Self {
            first,
            entries: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn first_id(&self) -> InstanceId {
        self.first
    }

    /// The next id that will be assigned by `append`.
    #[must_use]
    pub fn next_id(&self) -> InstanceId {
        InstanceId::new(self.first.as_u64() + self.entries.len() as u64)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, id: InstanceId) -> Option<usize> {
        if id < self.first {
            return None;
        }
        let idx = (id.as_u64() - self.first.as_u64()) as usize;
        if idx < self.entries.len() { Some(idx) } else { None }
    }

    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<&ConsensusInstance> {
        self.index_of(id).map(|idx| &self.entries[idx])
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut ConsensusInstance> {
        self.index_of(id).map(move |idx| &mut self.entries[idx])
    }

    #[must_use]
    pub fn state_of(&self, id: InstanceId) -> Option<InstanceState> {
        if id < self.first {
            // Truncated ids are implicitly decided: they were decided before
            // the snapshot that discarded them.
            return Some(InstanceState::Decided);
        }
        self.get(id).map(ConsensusInstance::state)
    }

    /// Appends a new `Known` entry at `next_id()`, returning it.
    pub fn append(&mut self, view: ViewNumber, value: Vec<u8>) -> &ConsensusInstance {
        let id = self.next_id();
        self.entries.push_back(ConsensusInstance::known(id, view, value));
        self.entries.back().expect("just pushed")
    }

    /// Ensures a slot exists at `id`, gap-filling with `Unknown` entries as
    /// needed (the Acceptor's behaviour on an out-of-order `Propose`).
    pub fn ensure(&mut self, id: InstanceId) -> &mut ConsensusInstance {
        while self.next_id() <= id {
            let gap_id = self.next_id();
            self.entries.push_back(ConsensusInstance::unknown(gap_id));
        }
        self.get_mut(id).expect("just ensured")
    }

    /// All ids in `[first_uncommitted, next_id())` whose state is `Known` or
    /// `Decided` — the `PrepareOK` payload.
    #[must_use]
    pub fn prepared_since(&self, first_uncommitted: InstanceId) -> Vec<ConsensusInstance> {
        let start = first_uncommitted.max(self.first);
        let mut out = Vec::new();
        let mut id = start;
        while id < self.next_id() {
            if let Some(entry) = self.get(id) {
                if entry.state() != InstanceState::Unknown {
                    out.push(entry.clone());
                }
            }
            id = id.next();
        }
        out
    }

    /// Discards all entries with id strictly below `watermark`. Must only be
    /// called once the service has applied everything below `watermark`
    /// (data model contract).
    pub fn truncate_below(&mut self, watermark: InstanceId) {
        if watermark <= self.first {
            return;
        }
        let drop_count = (watermark.as_u64() - self.first.as_u64()) as usize;
        let drop_count = drop_count.min(self.entries.len());
        for _ in 0..drop_count {
            self.entries.pop_front();
        }
        self.first = watermark;
    }

    /// Approximate on-log byte size (excluding the snapshot), used for the
    /// snapshot-ask/force policy.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.value().map_or(0, <[u8]>::len))
            .sum()
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_dense_ids() {
        let mut log = Log::new();
        log.append(ViewNumber::new(0), vec![1]);
        log.append(ViewNumber::new(0), vec![2]);
        assert_eq!(log.next_id(), InstanceId::new(2));
        assert_eq!(log.get(InstanceId::new(0)).unwrap().value(), Some(&[1][..]));
    }

    #[test]
    fn set_value_rejects_lower_view_as_noop() {
        let mut inst = ConsensusInstance::known(InstanceId::ZERO, ViewNumber::new(5), vec![9]);
        inst.set_value(ViewNumber::new(2), &[1, 2, 3]).unwrap();
        assert_eq!(inst.value(), Some(&[9][..]));
        assert_eq!(inst.view(), Some(ViewNumber::new(5)));
    }

    #[test]
    fn set_value_same_view_requires_identical_bytes() {
        let mut inst = ConsensusInstance::known(InstanceId::ZERO, ViewNumber::new(1), vec![1]);
        assert!(inst.set_value(ViewNumber::new(1), &[2]).is_err());
        inst.set_value(ViewNumber::new(1), &[1]).unwrap();
    }

    #[test]
    fn set_value_higher_view_overwrites() {
        let mut inst = ConsensusInstance::known(InstanceId::ZERO, ViewNumber::new(1), vec![1]);
        inst.set_value(ViewNumber::new(2), &[9]).unwrap();
        assert_eq!(inst.value(), Some(&[9][..]));
        assert_eq!(inst.view(), Some(ViewNumber::new(2)));
    }

    #[test]
    fn decided_values_are_immutable() {
        let mut inst = ConsensusInstance::known(InstanceId::ZERO, ViewNumber::new(1), vec![1]);
        inst.mark_decided();
        assert!(inst.set_value(ViewNumber::new(5), &[1]).is_ok());
        assert!(inst.set_value(ViewNumber::new(5), &[2]).is_err());
        assert_eq!(inst.value(), Some(&[1][..]));
    }

    #[test]
    fn ensure_gap_fills_with_unknown() {
        let mut log = Log::new();
        log.ensure(InstanceId::new(3));
        assert_eq!(log.next_id(), InstanceId::new(4));
        for i in 0..3 {
            assert_eq!(
                log.state_of(InstanceId::new(i)),
                Some(InstanceState::Unknown)
            );
        }
    }

    #[test]
    fn truncate_below_drops_prefix_and_reports_decided() {
        let mut log = Log::new();
        for i in 0..5u64 {
            log.append(ViewNumber::new(0), vec![i as u8]);
        }
        log.truncate_below(InstanceId::new(3));
        assert_eq!(log.first_id(), InstanceId::new(3));
        assert_eq!(log.len(), 2);
        assert_eq!(log.state_of(InstanceId::new(1)), Some(InstanceState::Decided));
        assert_eq!(log.get(InstanceId::new(1)), None);
    }

    #[test]
    fn accept_tracking_resets_on_view_bump() {
        let mut inst = ConsensusInstance::known(InstanceId::ZERO, ViewNumber::new(0), vec![1]);
        inst.record_accept(ViewNumber::new(0), ReplicaId::new(0));
        inst.record_accept(ViewNumber::new(0), ReplicaId::new(1));
        assert_eq!(inst.accept_count(), 2);
        inst.record_accept(ViewNumber::new(1), ReplicaId::new(2));
        assert_eq!(inst.accept_count(), 1);
    }
}
