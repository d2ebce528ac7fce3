//! Shared harness for the end-to-end scenarios: a small in-process cluster
//! of [`Dispatcher`]s wired through a channel [`Network`] that loops
//! messages back into the right replica's queue, the way the teacher's
//! `kimberlite-sim` crate drives a simulated cluster through its own
//! in-memory transport.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use paxos_core::config::EngineConfig;
use paxos_core::dispatcher::{Dispatcher, Task};
use paxos_core::network::Network;
use paxos_core::roles::Engine;
use paxos_core::service::Service;
use paxos_core::storage::InMemoryStableStorage;
use paxos_core::types::{InstanceId, ReplicaId, Request};

/// Records every `(instance_id, payload)` the engine ever delivered, and
/// echoes the payload back as the "reply" — enough to assert ordering and
/// content without modeling a real application.
#[derive(Default)]
pub struct RecordingService {
    pub executed: Vec<(InstanceId, Vec<u8>)>,
    pub snapshot_bytes: Vec<u8>,
}

impl Service for RecordingService {
    fn execute(&mut self, instance_id: InstanceId, request: &[u8]) -> Vec<u8> {
        self.executed.push((instance_id, request.to_vec()));
        request.to_vec()
    }

    fn make_snapshot(&self) -> Vec<u8> {
        if self.snapshot_bytes.is_empty() {
            b"snapshot".to_vec()
        } else {
            self.snapshot_bytes.clone()
        }
    }

    fn update_to_snapshot(&mut self, bytes: &[u8]) {
        self.snapshot_bytes = bytes.to_vec();
    }

    fn instance_executed(&mut self, _instance_id: InstanceId) {}
}

type Envelope = (ReplicaId, ReplicaId, paxos_core::message::Message);

#[derive(Clone)]
pub struct ChannelNetwork {
    self_id: ReplicaId,
    outbox: Rc<RefCell<VecDeque<Envelope>>>,
}

impl Network for ChannelNetwork {
    fn send_to(&mut self, dest: ReplicaId, msg: paxos_core::message::Message) {
        self.outbox.borrow_mut().push_back((self.self_id, dest, msg));
    }
}

pub type ReplicaDispatcher = Dispatcher<InMemoryStableStorage, RecordingService, ChannelNetwork>;

/// A `group_size`-replica cluster. Replica `i`'s state is reachable through
/// `dispatchers[i]`; `is_up[i] = false` simulates a crashed replica by
/// refusing to deliver it any further work.
pub struct Cluster {
    pub dispatchers: Vec<ReplicaDispatcher>,
    pub is_up: Vec<bool>,
    /// Partitioned replicas keep running their own clock (so their failure
    /// detector and proposer still tick) but every message to or from them
    /// is dropped, unlike `is_up` which also stops the replica's own clock.
    pub is_partitioned: Vec<bool>,
    outbox: Rc<RefCell<VecDeque<Envelope>>>,
    now_ms: u64,
}

/// Routes `tracing::info!`/`warn!` calls the engine emits (view changes,
/// decisions, snapshot installs) to the test harness's captured output
/// instead of nowhere; harmless if another test in the same binary already
/// installed a subscriber first.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("paxos_core=debug").try_init();
}

impl Cluster {
    #[must_use]
    pub fn new(group_size: usize) -> Self {
        Self::with_config(group_size, |c| c)
    }

    #[must_use]
    pub fn with_config(group_size: usize, configure: impl Fn(EngineConfig) -> EngineConfig) -> Self {
        init_tracing();
        let outbox = Rc::new(RefCell::new(VecDeque::new()));
        let dispatchers = (0..group_size)
            .map(|i| {
                let replica_id = ReplicaId::new(i as u8);
                let config = configure(EngineConfig::new(replica_id, group_size));
                let engine = Engine::new(config, 0);
                let network = ChannelNetwork {
                    self_id: replica_id,
                    outbox: outbox.clone(),
                };
                Dispatcher::new(engine, InMemoryStableStorage::new(), RecordingService::default(), network)
            })
            .collect();
        Self {
            dispatchers,
            is_up: vec![true; group_size],
            is_partitioned: vec![false; group_size],
            outbox,
            now_ms: 0,
        }
    }

    pub fn crash(&mut self, replica: usize) {
        self.is_up[replica] = false;
    }

    pub fn restart(&mut self, replica: usize) {
        self.is_up[replica] = true;
    }

    pub fn partition(&mut self, replica: usize) {
        self.is_partitioned[replica] = true;
    }

    pub fn heal(&mut self, replica: usize) {
        self.is_partitioned[replica] = false;
    }

    /// Advances the logical clock and lets every live replica's `on_tick`
    /// run, then floods every resulting message until the cluster is quiet.
    pub fn tick(&mut self, step_ms: u64) {
        self.now_ms += step_ms;
        for (i, up) in self.is_up.iter().enumerate() {
            if *up {
                self.dispatchers[i].try_enqueue(Task::Tick).unwrap();
            }
        }
        self.settle();
    }

    pub fn tick_n(&mut self, times: u32, step_ms: u64) {
        for _ in 0..times {
            self.tick(step_ms);
        }
    }

    /// Submits `request` to `replica` and settles the resulting message
    /// storm.
    pub fn propose(&mut self, replica: usize, request: Request) {
        self.dispatchers[replica].try_enqueue(Task::Propose(request)).unwrap();
        self.settle();
    }

    /// Enqueues every request in `requests` on `replica`'s dispatcher before
    /// settling anything — the way several clients submitting concurrently
    /// would pile up in the same dispatcher tick, as opposed to
    /// [`Cluster::propose`], which settles fully between each submission.
    pub fn propose_many(&mut self, replica: usize, requests: Vec<Request>) {
        for request in requests {
            self.dispatchers[replica].try_enqueue(Task::Propose(request)).unwrap();
        }
        self.settle();
    }

    /// Drains every dispatcher's queue, then redelivers every message that
    /// landed in the outbox (dropping anything addressed to a crashed
    /// replica), repeating until nothing moves.
    fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for (i, up) in self.is_up.iter().enumerate() {
                if !*up {
                    continue;
                }
                let outs = self.dispatchers[i].drain(self.now_ms).unwrap();
                if !outs.is_empty() {
                    progressed = true;
                }
            }

            let pending: Vec<Envelope> = self.outbox.borrow_mut().drain(..).collect();
            if pending.is_empty() && !progressed {
                break;
            }
            for (from, to, msg) in pending {
                let src = from.as_u8() as usize;
                let dest = to.as_u8() as usize;
                if self.is_up[dest] && !self.is_partitioned[src] && !self.is_partitioned[dest] {
                    self.dispatchers[dest]
                        .try_enqueue(Task::Inbound { from, message: msg })
                        .unwrap();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }
}
