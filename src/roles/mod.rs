//! The Paxos role state machine: Acceptor (C8), Learner (C9), Proposer
//! (C10), and the snapshot/catch-up subprotocol (C11), composed into one
//! [`Engine`] per replica.
//!
//! # Architecture
//!
//! `Engine` holds all mutable protocol state for one replica and exposes
//! one handler method per inbound event (message, timer, client proposal,
//! service event). Each handler takes the durable storage and the service
//! adapter as trait objects and returns an [`EngineOutput`] listing the
//! messages to send — mirroring the `ReplicaOutput` produced by the FCIS
//! state machine this design is grounded on, except storage/service calls
//! happen inline rather than being deferred as effects, since the data
//! model's durability-before-acknowledgement contract (§4.3) requires the
//! write to have already landed by the time a handler returns.
//!
//! Role logic is split across sibling modules the same way the teacher
//! crate splits `normal`/`view_change`/`repair` across files: [`acceptor`],
//! [`learner`], [`proposer`], [`catchup`] each `impl Engine` for their slice
//! of the protocol.

mod acceptor;
mod catchup;
mod learner;
mod proposer;

pub use proposer::ProposerState;

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::failure_detector::FailureDetector;
use crate::instrumentation::EngineMetrics;
use crate::log::Log;
use crate::message::Message;
use crate::retransmitter::{RetransmitHandle, Retransmitter};
use crate::service::Service;
use crate::storage::StableStorage;
use crate::types::{InstanceId, ReplicaId, Request, RequestId, ViewNumber};

/// Output produced by a single `Engine` handler call: the messages to hand
/// to the network, keyed by destination.
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub sends: Vec<(ReplicaId, Message)>,
}

impl EngineOutput {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    fn push(&mut self, dest: ReplicaId, msg: Message) {
        self.sends.push((dest, msg));
    }

    fn extend_sends(&mut self, sends: Vec<(ReplicaId, Message)>) {
        self.sends.extend(sends);
    }

    fn merge(&mut self, other: EngineOutput) {
        self.sends.extend(other.sends);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
    }
}

/// Proposer-only runtime state (§4.7): the INACTIVE/PREPARING/PREPARED
/// machine, its pending client requests, its view-change ballot box, and
/// the retransmit handles it owns.
pub(crate) struct ProposerRuntime {
    pub(crate) state: ProposerState,
    pub(crate) pending: VecDeque<Request>,
    pub(crate) pending_ids: HashSet<RequestId>,
    pub(crate) prepared_votes: HashSet<ReplicaId>,
    pub(crate) prepare_handle: Option<RetransmitHandle>,
    pub(crate) propose_handles: HashMap<InstanceId, RetransmitHandle>,
    pub(crate) last_retransmitted: InstanceId,
}

impl ProposerRuntime {
    fn new() -> Self {
        Self {
            state: ProposerState::Inactive,
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            prepared_votes: HashSet::new(),
            prepare_handle: None,
            propose_handles: HashMap::new(),
            last_retransmitted: InstanceId::ZERO,
        }
    }
}

/// Catch-up runtime state (§4.8): the in-flight query, if any, and its
/// self-adjusting resend timeout.
///
/// Deliberately not piggy-backed on [`Retransmitter`]: that type's resend
/// period is fixed at construction, but the catch-up query's timeout
/// self-adjusts (doubling from `CATCHUP_MIN_RESEND_TIMEOUT` up to
/// `PERIODIC_CATCHUP_TIMEOUT`), so it tracks its own due time instead.
pub(crate) struct CatchUpRuntime {
    pub(crate) requested: Vec<InstanceId>,
    pub(crate) resend_timeout_ms: u64,
    pub(crate) next_due_ms: u64,
    pub(crate) last_periodic_ms: u64,
}

impl CatchUpRuntime {
    fn new(config: &EngineConfig, now_ms: u64) -> Self {
        Self {
            requested: Vec::new(),
            resend_timeout_ms: config.catchup_min_resend_timeout.as_millis() as u64,
            next_due_ms: now_ms,
            last_periodic_ms: now_ms,
        }
    }
}

/// A read-only snapshot of a replica's status, for health checks and tests
/// (analogous to the accessor methods the teacher crate exposes directly on
/// `ReplicaState`, e.g. `is_leader`/`leader`/`log_len`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub view: ViewNumber,
    pub proposer_state: ProposerState,
    pub first_uncommitted: InstanceId,
    pub log_len: usize,
}

/// One replica's complete Paxos role state.
pub struct Engine {
    config: EngineConfig,
    view: ViewNumber,
    log: Log,

    /// The commit frontier: the smallest id not yet delivered to the
    /// service. Distinct from `log.first_id()`, which only advances when
    /// the log is truncated after a snapshot — `first_uncommitted` tracks
    /// delivery, truncation tracks storage reclamation.
    first_uncommitted: InstanceId,

    proposer: ProposerRuntime,
    catchup: CatchUpRuntime,
    failure_detector: FailureDetector,
    retransmitter: Retransmitter,
    metrics: EngineMetrics,

    /// Approximate byte size of the last-taken (or estimated) snapshot, for
    /// the ask/force policy of §4.8.
    last_snapshot_bytes: usize,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, now_ms: u64) -> Self {
        let failure_detector = FailureDetector::new(&config, now_ms);
        let catchup = CatchUpRuntime::new(&config, now_ms);
        let retransmit_period = config.retransmit_timeout;
        let is_genesis_leader = ViewNumber::ZERO.leader(config.group_size) == config.replica_id;
        let mut proposer = ProposerRuntime::new();
        if is_genesis_leader {
            // View 0 has no predecessor to recover a locked value from, so
            // its leader can skip phase 1 and start proposing directly —
            // there is nothing for a quorum of PrepareOK to reconcile yet.
            proposer.state = ProposerState::Prepared;
        }
        Self {
            config,
            view: ViewNumber::ZERO,
            log: Log::new(),
            first_uncommitted: InstanceId::ZERO,
            proposer,
            catchup,
            failure_detector,
            retransmitter: Retransmitter::new(retransmit_period),
            metrics: EngineMetrics::new(),
            last_snapshot_bytes: EngineConfig::initial_snapshot_estimate_bytes(),
        }
    }

    /// Restores an engine after a crash: the durable view always wins over
    /// `ViewNumber::ZERO`, honouring the crash contract that the recovered
    /// view is at least as high as any view ever observed. A snapshot, if
    /// present, seeds the service and the commit frontier; every instance
    /// durably decided since then is replayed from storage into both the log
    /// and the service, since the service's in-memory state does not survive
    /// the crash on its own.
    #[must_use]
    pub fn recover(
        config: EngineConfig,
        storage: &dyn StableStorage,
        service: &mut dyn Service,
        now_ms: u64,
    ) -> Self {
        let mut engine = Self::new(config, now_ms);
        engine.view = storage.current_view();
        if let Some(snapshot) = storage.last_snapshot() {
            engine.first_uncommitted = snapshot.last_included_instance_id.next();
            engine.log = Log::starting_at(engine.first_uncommitted);
            engine.last_snapshot_bytes = snapshot.service_bytes.len().max(1);
            service.update_to_snapshot(&snapshot.service_bytes);
        }

        loop {
            let Some(record) = storage.decided(engine.first_uncommitted) else {
                break;
            };
            let view = record.view.unwrap_or(engine.view);
            let value = record.value.clone().unwrap_or_default();
            let entry = engine.log.ensure(engine.first_uncommitted);
            if entry.set_value(view, &value).is_ok() {
                entry.mark_decided();
            }
            service.execute(engine.first_uncommitted, &value);
            service.instance_executed(engine.first_uncommitted);
            engine.first_uncommitted = engine.first_uncommitted.next();
        }

        engine
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            view: self.view,
            proposer_state: self.proposer.state,
            first_uncommitted: self.first_uncommitted,
            log_len: self.log.len(),
        }
    }

    #[must_use]
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    #[must_use]
    pub fn leader(&self) -> ReplicaId {
        self.view.leader(self.config.group_size)
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader() == self.config.replica_id
    }

    /// Every replica other than this one, in ascending id order.
    fn peers(&self) -> Vec<ReplicaId> {
        (0..self.config.group_size as u8)
            .map(ReplicaId::new)
            .filter(|id| *id != self.config.replica_id)
            .collect()
    }

    fn now_message(&self, payload: crate::message::MessagePayload, now_ms: u64) -> Message {
        Message::new(self.view, now_ms as i64, payload)
    }

    /// Durably advances the view if `candidate` is higher, resetting the
    /// failure detector so the new view gets a full timeout. Per the
    /// design's open question, `set_view` must be durable before any
    /// message carrying the new view is emitted — callers persist via this
    /// method *before* constructing outgoing messages.
    fn advance_view(
        &mut self,
        candidate: ViewNumber,
        storage: &mut dyn StableStorage,
        now_ms: u64,
    ) -> Result<bool, EngineError> {
        if candidate <= self.view {
            return Ok(false);
        }
        storage.set_view(candidate)?;
        self.view = candidate;
        self.failure_detector.note_view_advanced(now_ms);
        self.metrics.record_view_change();
        // Any proposer attempt in flight belonged to the view we're leaving —
        // a replica that was Preparing (or leading) a lower view has no claim
        // on this one, even if it happens to own a later view down the line.
        // `prepare_next_view` calls this *before* setting its own state to
        // Preparing, so this never clobbers a fresh self-promotion.
        self.stop_proposer();
        tracing::info!(replica = %self.config.replica_id, view = %candidate, "view advanced");
        Ok(true)
    }

    /// Periodic housekeeping: leader heartbeats, leader-suspicion, message
    /// retransmission, and catch-up retries. Called by the dispatcher on
    /// every `Tick` task.
    pub fn on_tick(
        &mut self,
        storage: &mut dyn StableStorage,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        let mut out = EngineOutput::empty();

        if self.failure_detector.should_send_alive(self.view, now_ms) {
            let msg = self.now_message(crate::message::MessagePayload::Alive(crate::message::Alive), now_ms);
            for dest in self.peers() {
                out.push(dest, msg.clone());
            }
        }

        if let Some(next_view) = self.failure_detector.tick(self.view, now_ms) {
            tracing::info!(replica = %self.config.replica_id, next_view = %next_view, "suspecting leader, advancing view");
            if next_view.leader(self.config.group_size) == self.config.replica_id {
                let prep_out = self.prepare_next_view(next_view, storage, now_ms)?;
                out.merge(prep_out);
            } else {
                self.advance_view(next_view, storage, now_ms)?;
            }
        }

        out.extend_sends(self.retransmitter.tick(now_ms));
        out.merge(self.catchup_tick(now_ms));

        Ok(out)
    }

    /// On `Alive` from `from`: liveness evidence for the failure detector,
    /// plus the general "a message for a higher view advances our view"
    /// rule from §4.4.
    pub fn on_alive(
        &mut self,
        from: ReplicaId,
        view: ViewNumber,
        storage: &mut dyn StableStorage,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        if view > self.view {
            self.advance_view(view, storage, now_ms)?;
        }
        if from == view.leader(self.config.group_size) {
            self.failure_detector.note_liveness(now_ms);
        }
        Ok(EngineOutput::empty())
    }
}
