//! The durable storage boundary (C5).
//!
//! `StableStorage` is consumed, not owned: production replicas back it with
//! a real durability mechanism (fsync'd files, a WAL, …) which is explicitly
//! out of this core's scope. The engine only requires the crash contract in
//! its doc comments, so tests use [`InMemoryStableStorage`], which satisfies
//! the trait but loses everything on drop — fine for simulation, wrong for
//! production.

use crate::error::StorageError;
use crate::log::InstanceState;
use crate::message::InstanceRecord;
use crate::types::{InstanceId, ViewNumber};

/// A durable checkpoint of the replicated service, installed by the
/// snapshot/catch-up subprotocol (C11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_instance_id: InstanceId,
    pub last_included_view: ViewNumber,
    pub service_bytes: Vec<u8>,
    pub client_reply_cache: Vec<u8>,
}

/// The durable half of the replica's state: current view, last snapshot,
/// and decided instance records.
///
/// # Crash contract
///
/// After a restart against the same backing store:
/// - the recovered view is `>=` the highest view ever durably set;
/// - every instance id previously reported `Decided` still reports
///   `Decided`, with the same committed value.
///
/// `set_view` and `mark_decided` must not return until the fact they record
/// is recoverable — callers (the Acceptor, Learner, Proposer) rely on this
/// to decide when it is safe to reply to a peer or deliver a decision to the
/// service.
pub trait StableStorage {
    fn current_view(&self) -> ViewNumber;

    /// Durably advances the view. A no-op (and not an error) if `view` is
    /// not higher than the current one — callers are expected to check
    /// monotonicity themselves, but storage must never regress.
    fn set_view(&mut self, view: ViewNumber) -> Result<(), StorageError>;

    /// Durably records that `id` decided at `view` with `value`.
    fn mark_decided(
        &mut self,
        id: InstanceId,
        view: ViewNumber,
        value: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// The decided record for `id`, if this store has one.
    fn decided(&self, id: InstanceId) -> Option<&InstanceRecord>;

    fn last_snapshot(&self) -> Option<&Snapshot>;

    /// Atomically installs `snapshot`, discarding decided records below its
    /// watermark (the log truncation itself is the caller's job — storage
    /// only needs to stop claiming to remember those ids).
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError>;
}

/// An in-memory [`StableStorage`] for tests and simulation. Not durable:
/// restart by constructing a new engine against the *same* instance to
/// simulate a crash-recovery cycle, or drop it to simulate total data loss.
#[derive(Debug, Default)]
pub struct InMemoryStableStorage {
    view: ViewNumber,
    decided: std::collections::BTreeMap<InstanceId, InstanceRecord>,
    snapshot: Option<Snapshot>,
}

impl InMemoryStableStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStorage for InMemoryStableStorage {
    fn current_view(&self) -> ViewNumber {
        self.view
    }

    fn set_view(&mut self, view: ViewNumber) -> Result<(), StorageError> {
        if view > self.view {
            self.view = view;
        }
        Ok(())
    }

    fn mark_decided(
        &mut self,
        id: InstanceId,
        view: ViewNumber,
        value: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.decided.insert(
            id,
            InstanceRecord {
                id,
                view: Some(view),
                state: InstanceState::Decided,
                value: Some(value),
            },
        );
        Ok(())
    }

    fn decided(&self, id: InstanceId) -> Option<&InstanceRecord> {
        self.decided.get(&id)
    }

    fn last_snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), StorageError> {
        self.decided
            .retain(|id, _| *id >= snapshot.last_included_instance_id.next());
        if snapshot.last_included_view > self.view {
            self.view = snapshot.last_included_view;
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }
}
