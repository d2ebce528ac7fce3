//! Error taxonomy for the replication engine.
//!
//! Maps the five error classes of the design to two Rust enums: most
//! conditions are handled by logging and dropping in place (`StaleMessage`,
//! `TransientNetwork`) and never surface as a `Result::Err` at all; the
//! remainder are represented here because the dispatcher's run loop must
//! distinguish a fatal abort (`ProtocolViolation`, `StorageFailure`) from a
//! client-visible admission refusal (`Busy`).

/// Errors surfaced by the durable storage boundary.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("stable storage io failure: {0}")]
    Io(String),

    #[error("stable storage record corrupt: {0}")]
    Corrupt(String),
}

/// Errors surfaced while decoding a wire message.
///
/// Always a `TransientNetwork` condition: the caller drops the message and
/// relies on retransmission, it is never propagated as a fatal error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("unknown message type byte: {0}")]
    UnknownType(u8),

    #[error("invalid length field: {0}")]
    InvalidLength(i32),
}

/// Errors returned by the engine's dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An invariant of the data model would be violated (e.g. two replicas
    /// decided different values for the same instance). Fatal: the caller
    /// must stop driving this engine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A durability write failed. Fatal for the same reason as above: the
    /// engine can no longer guarantee its crash-recovery contract.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// The dispatcher queue exceeds `busy_threshold`; the proposal was
    /// refused rather than queued. Not fatal — this is the client-visible
    /// admission-control condition from the design's error taxonomy.
    #[error("engine busy: queue depth {depth} exceeds threshold {threshold}")]
    Busy { depth: usize, threshold: usize },
}

impl EngineError {
    /// Returns true if this error should abort the replica's dispatcher loop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ProtocolViolation(_) | EngineError::StorageFailure(_)
        )
    }
}
