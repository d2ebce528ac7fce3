//! The dispatcher (C3): the single-threaded driver that owns one replica's
//! complete state and the only crossing point between the engine's pure
//! handlers and the outside world — network, stable storage, and the
//! replicated service.
//!
//! Mirrors the cooperative, run-to-completion scheduling model of §5: tasks
//! are enqueued from other threads (network I/O, timers, client submission)
//! across a bounded, thread-safe queue, and drained one at a time with no
//! suspension in between.

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::error::EngineError;
use crate::message::{Message, MessagePayload};
use crate::network::Network;
use crate::roles::{Engine, EngineOutput};
use crate::service::Service;
use crate::storage::StableStorage;
use crate::types::{ReplicaId, Request};

/// One unit of work the dispatcher can run to completion.
pub enum Task {
    /// A message delivered by the network, tagged with its sender — the
    /// engine's wire format carries no envelope fields, so sender identity
    /// travels alongside the message rather than inside it.
    Inbound { from: ReplicaId, message: Message },
    /// A logical-clock tick: drives retransmission, the failure detector,
    /// and catch-up housekeeping.
    Tick,
    /// A client-submitted proposal.
    Propose(Request),
}

/// Drives one [`Engine`] against concrete storage/service/network
/// implementations, enforcing the `busy_threshold` admission-control policy
/// from the error taxonomy (§7): a full client-proposal queue refuses new
/// proposals with [`EngineError::Busy`] rather than growing unboundedly, but
/// in-protocol messages (`Task::Inbound`) and timer ticks (`Task::Tick`) are
/// never refused for overload — they run on a separate, uncapped queue, so a
/// burst of client load can never stall the consensus protocol itself.
pub struct Dispatcher<S, V, N> {
    engine: Engine,
    storage: S,
    service: V,
    network: N,
    proposals: ArrayQueue<Request>,
    protocol: SegQueue<Task>,
}

impl<S, V, N> Dispatcher<S, V, N>
where
    S: StableStorage,
    V: Service,
    N: Network,
{
    #[must_use]
    pub fn new(engine: Engine, storage: S, service: V, network: N) -> Self {
        let capacity = engine.config().busy_threshold;
        Self {
            engine,
            storage,
            service,
            network,
            proposals: ArrayQueue::new(capacity),
            protocol: SegQueue::new(),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub fn service(&self) -> &V {
        &self.service
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.proposals.len() + self.protocol.len()
    }

    /// Enqueues `task`. Only `Task::Propose` is admission-gated against
    /// `busy_threshold` and can be refused with `Busy`; `Task::Inbound` and
    /// `Task::Tick` always succeed, since in-protocol messages must never be
    /// dropped for overload (§7).
    pub fn try_enqueue(&self, task: Task) -> Result<(), EngineError> {
        match task {
            Task::Propose(request) => {
                let threshold = self.proposals.capacity();
                self.proposals.push(request).map_err(|_| EngineError::Busy {
                    depth: threshold,
                    threshold,
                })
            }
            other => {
                self.protocol.push(other);
                Ok(())
            }
        }
    }

    /// Pops and runs exactly one task, handing any resulting messages to the
    /// network. Protocol tasks (inbound messages, ticks) are always drained
    /// ahead of client proposals, so a backlog of proposals never delays
    /// retransmission or failure detection. Returns `Ok(None)` if both queues
    /// were empty, and propagates fatal engine errors (`ProtocolViolation`,
    /// `StorageFailure`) — callers must stop driving this dispatcher on `Err`.
    pub fn run_once(&mut self, now_ms: u64) -> Result<Option<EngineOutput>, EngineError> {
        let task = if let Some(task) = self.protocol.pop() {
            task
        } else if let Some(request) = self.proposals.pop() {
            Task::Propose(request)
        } else {
            return Ok(None);
        };

        let out = self.run_task(task, now_ms)?;
        for (dest, msg) in &out.sends {
            self.network.send_to(*dest, msg.clone());
        }
        if !out.sends.is_empty() {
            self.engine.metrics().record_messages_sent(out.sends.len() as u64);
        }
        Ok(Some(out))
    }

    /// Drains the queue entirely, running every currently-queued task. New
    /// tasks enqueued by a concurrent producer while this call is in
    /// progress are picked up by the next call, not this one.
    pub fn drain(&mut self, now_ms: u64) -> Result<Vec<EngineOutput>, EngineError> {
        let mut outputs = Vec::new();
        while let Some(out) = self.run_once(now_ms)? {
            outputs.push(out);
        }
        Ok(outputs)
    }

    fn run_task(&mut self, task: Task, now_ms: u64) -> Result<EngineOutput, EngineError> {
        match task {
            Task::Tick => self.engine.on_tick(&mut self.storage, now_ms),
            Task::Propose(request) => {
                self.engine
                    .propose(request, &mut self.storage, &mut self.service, now_ms)
            }
            Task::Inbound { from, message } => self.dispatch_message(from, message, now_ms),
        }
    }

    fn dispatch_message(
        &mut self,
        from: ReplicaId,
        message: Message,
        now_ms: u64,
    ) -> Result<EngineOutput, EngineError> {
        self.engine.metrics().record_message_received();
        let view = message.view;
        match message.payload {
            MessagePayload::Prepare(p) => {
                self.engine
                    .on_prepare(from, view, p.first_uncommitted, &mut self.storage, now_ms)
            }
            MessagePayload::PrepareOk(p) => self.engine.on_prepare_ok(
                from,
                view,
                p.prepared,
                &mut self.storage,
                &mut self.service,
                now_ms,
            ),
            MessagePayload::Propose(p) => self.engine.on_propose(
                from,
                p.instance,
                &mut self.storage,
                &mut self.service,
                now_ms,
            ),
            MessagePayload::Accept(a) => self.engine.on_accept(
                from,
                view,
                a.instance_id,
                &mut self.storage,
                &mut self.service,
                now_ms,
            ),
            MessagePayload::Alive(_) => self.engine.on_alive(from, view, &mut self.storage, now_ms),
            MessagePayload::CatchUpQuery(q) => {
                Ok(self.engine.on_catchup_query(from, q.requested, &self.storage, now_ms))
            }
            MessagePayload::CatchUpResponse(r) => self.engine.on_catchup_response(
                r.entries,
                &mut self.storage,
                &mut self.service,
                now_ms,
            ),
            MessagePayload::CatchUpSnapshot(s) => {
                self.engine
                    .on_catchup_snapshot(s, &mut self.storage, &mut self.service, now_ms)
            }
        }
    }
}
