//! The Proposer (C10): view-change initiation, client-request batching, the
//! Propose pipeline, and gap retransmission.

use crate::error::EngineError;
use crate::log::InstanceState;
use crate::message::{MessagePayload, Prepare, Propose as ProposePayload};
use crate::service::Service;
use crate::storage::StableStorage;
use crate::types::{InstanceId, ReplicaId, Request, ViewNumber};

use super::{Engine, EngineOutput};

/// The Proposer's view-change state machine (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerState {
    /// Not attempting to lead. `propose()` is refused.
    Inactive,
    /// Phase 1 in flight: waiting for a quorum of `PrepareOK`.
    Preparing,
    /// Phase 1 complete: free to propose new values.
    Prepared,
}

/// The well-known no-op request value used to fill gaps left by a failed
/// leader (scenario 3 of §8).
const NO_OP: &[u8] = b"__no_op__";

impl Engine {
    /// Called on leader-change when this replica should become leader of
    /// `new_view`.
    pub(crate) fn prepare_next_view(
        &mut self,
        new_view: ViewNumber,
        storage: &mut dyn StableStorage,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        debug_assert_eq!(
            self.proposer.state,
            ProposerState::Inactive,
            "prepare_next_view called while already proposing"
        );

        // Advance first: `advance_view` calls `stop_proposer` to abandon any
        // stale attempt for the view we're leaving, which would otherwise
        // immediately clobber the Preparing state this function is about to
        // set.
        self.advance_view(new_view, storage, now_ms)?;

        self.proposer.prepared_votes.clear();
        // The new leader implicitly agrees with its own Prepare — it doesn't
        // mail itself a PrepareOK, but it still counts as one quorum member,
        // the same way `own_instance` records its own Accept directly rather
        // than waiting for a self-addressed message.
        self.proposer.prepared_votes.insert(self.config.replica_id);
        self.proposer.state = ProposerState::Preparing;

        let prepare = self.now_message(
            MessagePayload::Prepare(Prepare {
                first_uncommitted: self.first_uncommitted,
            }),
            now_ms,
        );
        let dests = self.peers();
        let (handle, sends) = self.retransmitter.start_transmitting(prepare, dests, now_ms);
        self.proposer.prepare_handle = Some(handle);

        let mut out = EngineOutput::empty();
        out.extend_sends(sends);
        Ok(out)
    }

    /// Handles an inbound `PrepareOK(v, prepared[])`.
    pub fn on_prepare_ok(
        &mut self,
        from: ReplicaId,
        view: ViewNumber,
        prepared: Vec<crate::message::InstanceRecord>,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.failure_detector.note_liveness(now_ms);
        if view != self.view
            || !matches!(
                self.proposer.state,
                ProposerState::Preparing | ProposerState::Prepared
            )
        {
            self.metrics.record_message_dropped_stale();
            return Ok(EngineOutput::empty());
        }
        if self.proposer.state == ProposerState::Prepared {
            // Already past phase 1; a late PrepareOK carries nothing new.
            return Ok(EngineOutput::empty());
        }

        for record in prepared {
            self.reconcile_prepared_record(record, storage, service, now_ms)?;
        }

        self.proposer.prepared_votes.insert(from);
        if let Some(handle) = self.proposer.prepare_handle {
            self.retransmitter.stop_destination(handle, from);
        }

        let mut out = EngineOutput::empty();
        if self.proposer.prepared_votes.len() >= self.config.quorum_size() {
            let transition_out = self.stop_preparing_start_proposing(storage, service, now_ms)?;
            out.merge(transition_out);
        }
        Ok(out)
    }

    /// Reconciles one `PrepareOK` entry against the local log, honouring
    /// invariants 2 and 3.
    fn reconcile_prepared_record(
        &mut self,
        record: crate::message::InstanceRecord,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.log.state_of(record.id) == Some(InstanceState::Decided) {
            return Ok(());
        }

        match record.state {
            InstanceState::Decided => {
                let value = record.value.clone().unwrap_or_default();
                self.log.ensure(record.id);
                if let (Some(entry), Some(view)) = (self.log.get_mut(record.id), record.view) {
                    entry
                        .set_value(view, &value)
                        .map_err(EngineError::ProtocolViolation)?;
                    entry.mark_decided();
                }
                self.deliver_decided(record.id, &value, storage, service, now_ms)?;
            }
            InstanceState::Known => {
                let local_view = self
                    .log
                    .get(record.id)
                    .and_then(crate::log::ConsensusInstance::view);
                let adopt = match (local_view, record.view) {
                    (None, _) => true,
                    (Some(lv), Some(rv)) => rv > lv,
                    (Some(_), None) => false,
                };
                if adopt {
                    self.log.ensure(record.id);
                    if let (Some(entry), Some(view), Some(value)) =
                        (self.log.get_mut(record.id), record.view, record.value)
                    {
                        entry
                            .set_value(view, &value)
                            .map_err(EngineError::ProtocolViolation)?;
                    }
                }
            }
            InstanceState::Unknown => {}
        }
        Ok(())
    }

    /// On quorum of `PrepareOK`: re-propose every still-locked value under
    /// the new view, fill every gap with `NoOp`, then drain pending
    /// proposals.
    fn stop_preparing_start_proposing(
        &mut self,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.proposer.state = ProposerState::Prepared;
        if let Some(handle) = self.proposer.prepare_handle.take() {
            self.retransmitter.stop(handle);
        }

        let mut out = EngineOutput::empty();
        let mut id = self.first_uncommitted;
        while id < self.log.next_id() {
            match self.log.state_of(id) {
                Some(InstanceState::Decided) | None => {}
                Some(InstanceState::Known) => {
                    let value = self
                        .log
                        .get(id)
                        .and_then(crate::log::ConsensusInstance::value)
                        .unwrap_or(&[])
                        .to_vec();
                    let reown = self.own_instance(id, value, now_ms);
                    out.merge(reown);
                }
                Some(InstanceState::Unknown) => {
                    let reown = self.own_instance(id, NO_OP.to_vec(), now_ms);
                    out.merge(reown);
                }
            }
            id = id.next();
        }

        let drain_out = self.send_next_proposal(storage, service, now_ms)?;
        out.merge(drain_out);
        Ok(out)
    }

    /// Writes `value` into the local log entry at `id` under the current
    /// view, marks this replica's own accept, and starts retransmitting
    /// `Propose` — the shared tail of `continueProposal` and
    /// `sendNextProposal`'s fresh-append path.
    fn own_instance(&mut self, id: InstanceId, value: Vec<u8>, now_ms: u64) -> EngineOutput {
        let view = self.view;
        self.log.ensure(id);
        if let Some(entry) = self.log.get_mut(id) {
            let _ = entry.set_value(view, &value);
            entry.record_accept(view, self.config.replica_id);
        }
        self.continue_proposal(id, now_ms)
    }

    /// Starts (or restarts) retransmitting `Propose` for `id` to every
    /// acceptor but self.
    pub(crate) fn continue_proposal(&mut self, id: InstanceId, now_ms: u64) -> EngineOutput {
        let Some(entry) = self.log.get(id) else {
            return EngineOutput::empty();
        };
        let record = crate::message::InstanceRecord::from_instance(entry);
        let msg = self.now_message(MessagePayload::Propose(ProposePayload { instance: record }), now_ms);
        let dests = self.peers();
        let (handle, sends) = self.retransmitter.start_transmitting(msg, dests, now_ms);
        self.proposer.propose_handles.insert(id, handle);

        let mut out = EngineOutput::empty();
        out.extend_sends(sends);
        out
    }

    /// Client-initiated: enqueue `request` for proposal.
    pub fn propose(
        &mut self,
        request: Request,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        if self.proposer.state == ProposerState::Inactive {
            return Ok(EngineOutput::empty());
        }
        if self.proposer.pending_ids.contains(&request.id) {
            return Ok(EngineOutput::empty());
        }
        self.proposer.pending_ids.insert(request.id);
        self.proposer.pending.push_back(request);
        self.send_next_proposal(storage, service, now_ms)
    }

    /// Window bound: the highest id this replica may append right now.
    fn window_end(&self) -> InstanceId {
        InstanceId::new(self.first_uncommitted.as_u64() + self.config.window_size as u64)
    }

    /// Batches as many pending requests as fit, appends them as one log
    /// entry, and starts proposing it — or, if preparing, empty, or past
    /// the window, retransmits gaps instead (§4.7.1).
    pub(crate) fn send_next_proposal(
        &mut self,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        if self.proposer.state == ProposerState::Preparing {
            return Ok(EngineOutput::empty());
        }

        if self.proposer.pending.is_empty() || self.log.next_id() >= self.window_end() {
            return self.retransmit_gaps(storage, service, now_ms);
        }

        let first = self.proposer.pending.front().expect("checked non-empty");
        let budget = self.config.batch_size.max(4 + first.payload.len());
        let mut buffer = vec![0u8; 4];
        let mut count: u32 = 0;

        while let Some(next) = self.proposer.pending.front() {
            if count > 0 && buffer.len() + next.payload.len() > budget {
                break;
            }
            let request = self.proposer.pending.pop_front().expect("just peeked");
            self.proposer.pending_ids.remove(&request.id);
            buffer.extend_from_slice(&request.payload);
            count += 1;
        }
        buffer[0..4].copy_from_slice(&count.to_be_bytes());

        let id = self.log.next_id();
        let view = self.view;
        self.log.append(view, buffer);
        if let Some(entry) = self.log.get_mut(id) {
            entry.record_accept(view, self.config.replica_id);
        }

        Ok(self.continue_proposal(id, now_ms))
    }

    /// Walks undecided ids in `[lastRetransmitted, nextId)` and forces an
    /// extra `Propose` send for each.
    fn retransmit_gaps(
        &mut self,
        _storage: &mut dyn StableStorage,
        _service: &mut dyn Service,
        _now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        let mut out = EngineOutput::empty();
        let bound = self.log.next_id();
        let mut id = self.proposer.last_retransmitted.max(self.first_uncommitted);
        while id < bound {
            if self.log.state_of(id) != Some(InstanceState::Decided) {
                if let Some(handle) = self.proposer.propose_handles.get(&id) {
                    out.extend_sends(self.retransmitter.force_retransmit(*handle));
                }
            }
            id = id.next();
        }
        self.proposer.last_retransmitted = bound;
        Ok(out)
    }

    /// Cancels retransmission of `Propose` for `id`, optionally scoped to a
    /// single destination (the bandwidth-saving path taken when an
    /// individual `Accept` is observed rather than a full quorum).
    pub(crate) fn stop_propose(&mut self, id: InstanceId, dest: Option<ReplicaId>) {
        let Some(handle) = self.proposer.propose_handles.get(&id).copied() else {
            return;
        };
        match dest {
            Some(dest) => self.retransmitter.stop_destination(handle, dest),
            None => {
                self.retransmitter.stop(handle);
                self.proposer.propose_handles.remove(&id);
            }
        }
    }

    /// Called by the Learner after a Decide, to refill the proposal window.
    pub(crate) fn ballot_finished(
        &mut self,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.send_next_proposal(storage, service, now_ms)
    }

    /// Called on leader loss: deactivates the proposer and cancels every
    /// outstanding retransmission it owns.
    pub(crate) fn stop_proposer(&mut self) {
        self.proposer.state = ProposerState::Inactive;
        self.proposer.pending.clear();
        self.proposer.pending_ids.clear();
        self.proposer.prepared_votes.clear();
        if let Some(handle) = self.proposer.prepare_handle.take() {
            self.retransmitter.stop(handle);
        }
        for (_, handle) in self.proposer.propose_handles.drain() {
            self.retransmitter.stop(handle);
        }
    }
}
