//! The Learner (C9): counts `Accept`s, declares `Decided`, and delivers the
//! contiguous decided prefix to the replicated service in order.

use crate::error::EngineError;
use crate::log::InstanceState;
use crate::service::Service;
use crate::storage::StableStorage;
use crate::types::{InstanceId, ReplicaId, ViewNumber};

use super::{Engine, EngineOutput};

impl Engine {
    /// On `Accept(id, v)` from `from`.
    pub fn on_accept(
        &mut self,
        from: ReplicaId,
        view: ViewNumber,
        instance_id: InstanceId,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.failure_detector.note_liveness(now_ms);
        let mut out = EngineOutput::empty();

        if self.log.state_of(instance_id) == Some(InstanceState::Decided) {
            self.stop_propose(instance_id, Some(from));
            return Ok(out);
        }

        let entry = self.log.ensure(instance_id);
        if let Some(local_view) = entry.view() {
            if view < local_view {
                return Ok(out);
            }
        }
        entry.record_accept(view, from);

        // An individual Accept, quorum or not, means `from` already has the
        // value — no need to keep retransmitting Propose to it.
        self.stop_propose(instance_id, Some(from));

        let quorum = self.config.quorum_size();
        let reached = self
            .log
            .get(instance_id)
            .is_some_and(|e| !e.is_decided() && e.accept_count() >= quorum);
        if !reached {
            return Ok(out);
        }

        let snapshot = {
            let entry = self.log.get(instance_id).expect("just checked reached");
            (entry.value().map(<[u8]>::to_vec), entry.view())
        };
        if let (Some(value), Some(_)) = snapshot {
            self.deliver_decided(instance_id, &value, storage, service, now_ms)?;
        }
        self.stop_propose(instance_id, None);

        let finish_out = self.ballot_finished(storage, service, now_ms)?;
        out.merge(finish_out);
        Ok(out)
    }

    /// Marks `id` durably `Decided` with `value`, then delivers every
    /// contiguous decided instance from `first_uncommitted` onward to the
    /// service, advancing the commit frontier in strictly ascending order
    /// (P3).
    pub(crate) fn deliver_decided(
        &mut self,
        id: InstanceId,
        value: &[u8],
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let view = self.log.get(id).and_then(crate::log::ConsensusInstance::view).unwrap_or(self.view);
        storage.mark_decided(id, view, value.to_vec())?;
        if let Some(entry) = self.log.get_mut(id) {
            let _ = entry.set_value(view, value);
            entry.mark_decided();
        }
        self.metrics.record_decision();
        tracing::info!(replica = %self.config.replica_id, instance = %id, view = %view, "instance decided");

        while self.log.state_of(self.first_uncommitted) == Some(InstanceState::Decided) {
            let bytes = self
                .log
                .get(self.first_uncommitted)
                .and_then(crate::log::ConsensusInstance::value)
                .map(<[u8]>::to_vec);
            if let Some(bytes) = bytes {
                service.execute(self.first_uncommitted, &bytes);
                service.instance_executed(self.first_uncommitted);
            } else {
                // Below the log's retained prefix (already truncated by a
                // snapshot) — nothing left to replay, just advance past it.
            }
            self.first_uncommitted = self.first_uncommitted.next();
            self.maybe_snapshot(storage, service, now_ms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::InMemoryStableStorage;

    struct RecordingService {
        executed: Vec<(InstanceId, Vec<u8>)>,
    }

    impl Service for RecordingService {
        fn execute(&mut self, instance_id: InstanceId, request: &[u8]) -> Vec<u8> {
            self.executed.push((instance_id, request.to_vec()));
            Vec::new()
        }
        fn make_snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn update_to_snapshot(&mut self, _bytes: &[u8]) {}
        fn instance_executed(&mut self, _instance_id: InstanceId) {}
    }

    #[test]
    fn quorum_of_accepts_decides_and_delivers() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let mut storage = InMemoryStableStorage::new();
        let mut service = RecordingService { executed: vec![] };
        engine.log.append(ViewNumber::new(0), b"payload".to_vec());

        let out = engine
            .on_accept(ReplicaId::new(1), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();
        assert!(out.is_empty()); // 1 accept, quorum is 2: not yet decided

        engine
            .on_accept(ReplicaId::new(2), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();

        assert_eq!(service.executed, vec![(InstanceId::ZERO, b"payload".to_vec())]);
        assert_eq!(engine.status().first_uncommitted, InstanceId::new(1));
        assert!(storage.decided(InstanceId::ZERO).is_some());
    }

    #[test]
    fn decisions_deliver_in_order_even_if_accepts_arrive_out_of_order() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let mut storage = InMemoryStableStorage::new();
        let mut service = RecordingService { executed: vec![] };
        engine.log.append(ViewNumber::new(0), b"first".to_vec());
        engine.log.append(ViewNumber::new(0), b"second".to_vec());

        // Decide instance 1 before instance 0: must not deliver out of order.
        engine
            .on_accept(ReplicaId::new(1), ViewNumber::new(0), InstanceId::new(1), &mut storage, &mut service, 0)
            .unwrap();
        engine
            .on_accept(ReplicaId::new(2), ViewNumber::new(0), InstanceId::new(1), &mut storage, &mut service, 0)
            .unwrap();
        assert!(service.executed.is_empty());

        engine
            .on_accept(ReplicaId::new(1), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();
        engine
            .on_accept(ReplicaId::new(2), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();

        assert_eq!(
            service.executed,
            vec![
                (InstanceId::ZERO, b"first".to_vec()),
                (InstanceId::new(1), b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn accept_for_decided_instance_only_stops_retransmission() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let mut storage = InMemoryStableStorage::new();
        let mut service = RecordingService { executed: vec![] };
        engine.log.append(ViewNumber::new(0), b"x".to_vec());
        engine
            .on_accept(ReplicaId::new(1), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();
        engine
            .on_accept(ReplicaId::new(2), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 0)
            .unwrap();
        assert_eq!(service.executed.len(), 1);

        let out = engine
            .on_accept(ReplicaId::new(1), ViewNumber::new(0), InstanceId::ZERO, &mut storage, &mut service, 10)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(service.executed.len(), 1);
    }
}
