//! The Acceptor (C8): handles inbound `Prepare`/`Propose`, replying with
//! `PrepareOK`/`Accept`. Stateless across instances — all state lives in
//! [`crate::log::Log`] and [`crate::storage::StableStorage`].

use crate::error::EngineError;
use crate::message::{Accept, InstanceRecord, MessagePayload, PrepareOk};
use crate::service::Service;
use crate::storage::StableStorage;
use crate::types::{InstanceId, ReplicaId, ViewNumber};

use super::{Engine, EngineOutput};

impl Engine {
    /// On `Prepare(v, firstUncommitted)` from `from`.
    pub fn on_prepare(
        &mut self,
        from: ReplicaId,
        view: ViewNumber,
        first_uncommitted: InstanceId,
        storage: &mut dyn StableStorage,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        if view < self.view {
            self.metrics.record_message_dropped_stale();
            return Ok(EngineOutput::empty());
        }
        if view > self.view {
            self.advance_view(view, storage, now_ms)?;
        } else {
            self.failure_detector.note_liveness(now_ms);
        }

        let prepared: Vec<InstanceRecord> = self
            .log
            .prepared_since(first_uncommitted)
            .iter()
            .map(InstanceRecord::from_instance)
            .collect();

        let mut out = EngineOutput::empty();
        let msg = self.now_message(MessagePayload::PrepareOk(PrepareOk { prepared }), now_ms);
        out.push(from, msg);
        Ok(out)
    }

    /// On `Propose(instance')` from `from`.
    pub fn on_propose(
        &mut self,
        from: ReplicaId,
        instance: InstanceRecord,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        let new_view = instance
            .view
            .ok_or_else(|| EngineError::ProtocolViolation("Propose carried no view".to_string()))?;

        if new_view < self.view {
            self.metrics.record_message_dropped_stale();
            return Ok(EngineOutput::empty());
        }
        if new_view > self.view {
            self.advance_view(new_view, storage, now_ms)?;
        } else {
            self.failure_detector.note_liveness(now_ms);
        }

        let value = instance.value.unwrap_or_default();
        let entry = self.log.ensure(instance.id);
        entry
            .set_value(new_view, &value)
            .map_err(EngineError::ProtocolViolation)?;

        // Accept is broadcast to every replica, not just the proposer that
        // sent the Propose: every replica is also a Learner and must be
        // able to count its own quorum independently (§4.6, scenario 1 — all
        // replicas reach DECIDED, not just the leader). Two votes are
        // recorded locally before anything goes out: this acceptor's own
        // acceptance, and `from`'s — the proposer never mails itself an
        // Accept (`own_instance` records it directly), so without crediting
        // it here a receiving Learner would be permanently short exactly the
        // one vote the proposer already cast for its own value.
        let self_id = self.config.replica_id;
        let mut out = self.on_accept(from, new_view, instance.id, storage, service, now_ms)?;
        out.merge(self.on_accept(self_id, new_view, instance.id, storage, service, now_ms)?);

        let accept = self.now_message(
            MessagePayload::Accept(Accept {
                instance_id: instance.id,
            }),
            now_ms,
        );
        for dest in self.peers() {
            out.push(dest, accept.clone());
        }
        Ok(out)
    }
}
