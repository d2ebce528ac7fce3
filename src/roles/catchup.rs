//! Snapshot and catch-up (C11): the snapshot ask/force policy and the
//! gap-filling subprotocol for replicas that fall behind.

use std::collections::HashSet;

use crate::error::EngineError;
use crate::log::InstanceState;
use crate::message::{CatchUpQuery, CatchUpResponse, CatchUpSnapshot, InstanceRecord, MessagePayload};
use crate::service::Service;
use crate::storage::{Snapshot, StableStorage};
use crate::types::{InstanceId, ReplicaId};

use super::{Engine, EngineOutput};

impl Engine {
    /// Every id this replica knows about but has no value for — the set a
    /// `CatchUpQuery` should ask for.
    fn missing_ids(&self) -> Vec<InstanceId> {
        let mut ids = Vec::new();
        let mut id = self.log.first_id().max(self.first_uncommitted);
        while id < self.log.next_id() {
            if self.log.state_of(id) == Some(InstanceState::Unknown) {
                ids.push(id);
            }
            id = id.next();
        }
        ids
    }

    /// Periodic housekeeping for the catch-up subprotocol: (re)issues a
    /// `CatchUpQuery` on a self-adjusting timeout, doubling from
    /// `catchup_min_resend_timeout` up to `periodic_catchup_timeout`, and
    /// unconditionally at least once per `periodic_catchup_timeout`.
    pub(crate) fn catchup_tick(&mut self, now_ms: u64) -> EngineOutput {
        let mut out = EngineOutput::empty();
        let missing = self.missing_ids();

        if missing.is_empty() {
            self.catchup.requested.clear();
            self.catchup.resend_timeout_ms = self.config.catchup_min_resend_timeout.as_millis() as u64;
            return out;
        }

        let periodic_ms = self.config.periodic_catchup_timeout.as_millis() as u64;
        let periodic_due = now_ms.saturating_sub(self.catchup.last_periodic_ms) >= periodic_ms;
        let resend_due = now_ms >= self.catchup.next_due_ms;
        let set_changed = self.catchup.requested != missing;

        if !periodic_due && !resend_due && !set_changed {
            return out;
        }

        self.catchup.requested = missing.clone();
        if periodic_due {
            self.catchup.last_periodic_ms = now_ms;
        }
        self.catchup.next_due_ms = now_ms + self.catchup.resend_timeout_ms;
        self.catchup.resend_timeout_ms = (self.catchup.resend_timeout_ms * 2).min(periodic_ms);

        let msg = self.now_message(MessagePayload::CatchUpQuery(CatchUpQuery { requested: missing }), now_ms);
        for dest in self.peers() {
            out.push(dest, msg.clone());
        }
        out
    }

    /// On `CatchUpQuery(requested)` from `from`: reply with decided entries
    /// we have, or a snapshot if the oldest requested id predates our log.
    pub fn on_catchup_query(
        &mut self,
        from: ReplicaId,
        requested: Vec<InstanceId>,
        storage: &dyn StableStorage,
        now_ms: u64,
    ) -> EngineOutput {
        self.failure_detector.note_liveness(now_ms);
        let mut out = EngineOutput::empty();

        let oldest = requested.iter().min().copied();
        if let Some(oldest) = oldest {
            if oldest < self.log.first_id() {
                if let Some(snapshot) = storage.last_snapshot() {
                    let msg = self.now_message(
                        MessagePayload::CatchUpSnapshot(CatchUpSnapshot {
                            last_included_instance_id: snapshot.last_included_instance_id,
                            last_included_view: snapshot.last_included_view,
                            service_bytes: snapshot.service_bytes.clone(),
                            client_reply_cache: snapshot.client_reply_cache.clone(),
                        }),
                        now_ms,
                    );
                    out.push(from, msg);
                    return out;
                }
            }
        }

        let entries: Vec<InstanceRecord> = requested
            .into_iter()
            .filter_map(|id| self.log.get(id))
            .filter(|entry| entry.is_decided())
            .map(InstanceRecord::from_instance)
            .collect();
        if !entries.is_empty() {
            let msg = self.now_message(MessagePayload::CatchUpResponse(CatchUpResponse { entries }), now_ms);
            out.push(from, msg);
        }
        out
    }

    /// On `CatchUpResponse(entries)`: adopt every decided entry we didn't
    /// already have, delivering contiguous prefixes to the service exactly
    /// as a normal `Decide` would.
    pub fn on_catchup_response(
        &mut self,
        entries: Vec<InstanceRecord>,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.failure_detector.note_liveness(now_ms);
        let satisfied: HashSet<InstanceId> = entries.iter().map(|record| record.id).collect();

        for record in entries {
            if record.state == InstanceState::Decided {
                if let Some(value) = record.value {
                    self.deliver_decided(record.id, &value, storage, service, now_ms)?;
                }
            }
        }

        self.catchup.requested.retain(|id| !satisfied.contains(id));
        Ok(EngineOutput::empty())
    }

    /// On `CatchUpSnapshot`: installs it atomically and fast-forwards past
    /// every instance it covers.
    pub fn on_catchup_snapshot(
        &mut self,
        snapshot: CatchUpSnapshot,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.failure_detector.note_liveness(now_ms);
        let new_first = snapshot.last_included_instance_id.next();
        if new_first <= self.first_uncommitted {
            return Ok(EngineOutput::empty());
        }

        self.advance_view(snapshot.last_included_view, storage, now_ms)?;
        service.update_to_snapshot(&snapshot.service_bytes);

        let byte_len = snapshot.service_bytes.len().max(1);
        storage.install_snapshot(Snapshot {
            last_included_instance_id: snapshot.last_included_instance_id,
            last_included_view: snapshot.last_included_view,
            service_bytes: snapshot.service_bytes,
            client_reply_cache: snapshot.client_reply_cache,
        })?;

        self.log.truncate_below(new_first);
        self.first_uncommitted = new_first;
        self.last_snapshot_bytes = byte_len;
        self.catchup.requested.clear();
        self.metrics.record_snapshot_installed();
        tracing::info!(
            replica = %self.config.replica_id,
            last_included = %snapshot.last_included_instance_id,
            "snapshot installed via catch-up"
        );
        Ok(EngineOutput::empty())
    }

    fn ask_threshold(&self) -> usize {
        let scaled = self.config.snapshot_ask_ratio * self.last_snapshot_bytes as f64;
        self.config.snapshot_min_log_size.max(scaled as usize)
    }

    fn force_threshold(&self) -> usize {
        (self.config.snapshot_force_ratio * self.last_snapshot_bytes as f64) as usize
    }

    /// Asks the service for a snapshot once the on-log byte size crosses the
    /// ask threshold, installs it, and truncates the log below its
    /// watermark. Logs a warning if the force threshold was already
    /// crossed — in this single-threaded engine the snapshot is taken
    /// synchronously, so the window in which appends should be refused
    /// between "asked" and "forced" never actually opens.
    pub(crate) fn maybe_snapshot(
        &mut self,
        storage: &mut dyn StableStorage,
        service: &mut dyn Service,
        _now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.first_uncommitted.is_zero() {
            return Ok(());
        }
        if self.log.byte_size() < self.ask_threshold() {
            return Ok(());
        }
        if self.log.byte_size() >= self.force_threshold() {
            tracing::warn!(replica = %self.config.replica_id, "snapshot force threshold reached");
        }

        let last_included = InstanceId::new(self.first_uncommitted.as_u64() - 1);
        let last_included_view = self
            .log
            .get(last_included)
            .and_then(crate::log::ConsensusInstance::view)
            .unwrap_or(self.view);
        let service_bytes = service.make_snapshot();
        let byte_len = service_bytes.len().max(1);

        storage.install_snapshot(Snapshot {
            last_included_instance_id: last_included,
            last_included_view,
            service_bytes,
            client_reply_cache: Vec::new(),
        })?;
        self.log.truncate_below(last_included.next());
        self.last_snapshot_bytes = byte_len;
        self.metrics.record_snapshot_installed();
        tracing::info!(replica = %self.config.replica_id, last_included = %last_included, "snapshot taken");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::InMemoryStableStorage;
    use crate::types::ViewNumber;

    struct NullService;
    impl Service for NullService {
        fn execute(&mut self, _instance_id: InstanceId, _request: &[u8]) -> Vec<u8> {
            Vec::new()
        }
        fn make_snapshot(&self) -> Vec<u8> {
            b"checkpoint".to_vec()
        }
        fn update_to_snapshot(&mut self, _bytes: &[u8]) {}
        fn instance_executed(&mut self, _instance_id: InstanceId) {}
    }

    #[test]
    fn catchup_tick_requests_unknown_gaps() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        engine.log.ensure(InstanceId::new(2));
        let out = engine.catchup_tick(0);
        assert_eq!(out.sends.len(), 2); // broadcast to the two peers
        match &out.sends[0].1.payload {
            MessagePayload::CatchUpQuery(q) => {
                assert_eq!(q.requested, vec![InstanceId::ZERO, InstanceId::new(1), InstanceId::new(2)]);
            }
            other => panic!("expected CatchUpQuery, got {other:?}"),
        }
    }

    #[test]
    fn catchup_tick_is_silent_once_caught_up() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let out = engine.catchup_tick(0);
        assert!(out.is_empty());
    }

    #[test]
    fn catchup_query_with_truncated_prefix_answers_with_snapshot() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let mut storage = InMemoryStableStorage::new();
        storage
            .install_snapshot(Snapshot {
                last_included_instance_id: InstanceId::new(4),
                last_included_view: ViewNumber::new(1),
                service_bytes: b"state".to_vec(),
                client_reply_cache: vec![],
            })
            .unwrap();
        engine.log = crate::log::Log::starting_at(InstanceId::new(5));

        let out = engine.on_catchup_query(ReplicaId::new(1), vec![InstanceId::new(0)], &storage, 0);
        assert_eq!(out.sends.len(), 1);
        assert!(matches!(out.sends[0].1.payload, MessagePayload::CatchUpSnapshot(_)));
    }

    #[test]
    fn catchup_snapshot_installs_and_fast_forwards() {
        let mut engine = Engine::new(EngineConfig::new(ReplicaId::new(0), 3), 0);
        let mut storage = InMemoryStableStorage::new();
        let mut service = NullService;

        let snapshot = CatchUpSnapshot {
            last_included_instance_id: InstanceId::new(9),
            last_included_view: ViewNumber::new(2),
            service_bytes: b"state".to_vec(),
            client_reply_cache: vec![],
        };
        engine
            .on_catchup_snapshot(snapshot, &mut storage, &mut service, 0)
            .unwrap();

        assert_eq!(engine.status().first_uncommitted, InstanceId::new(10));
        assert_eq!(engine.view(), ViewNumber::new(2));
        assert_eq!(engine.log.first_id(), InstanceId::new(10));
    }

    #[test]
    fn snapshot_is_taken_once_log_exceeds_ask_threshold() {
        let mut engine = Engine::new(
            EngineConfig::new(ReplicaId::new(0), 3),
            0,
        );
        let mut storage = InMemoryStableStorage::new();
        let mut service = NullService;
        let big = vec![0u8; 128 * 1024];
        engine.log.append(ViewNumber::new(0), big);
        engine.first_uncommitted = InstanceId::new(1);

        engine.maybe_snapshot(&mut storage, &mut service, 0).unwrap();
        assert!(storage.last_snapshot().is_some());
        assert_eq!(engine.log.byte_size(), 0);
    }
}
