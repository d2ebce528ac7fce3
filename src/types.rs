//! Core identifiers and newtypes shared across the engine.
//!
//! Mirrors the small-newtype style used throughout the crate this engine is
//! grounded on: a `u64`/`u8` wrapper per concept, `Ord`/`Hash` derived so the
//! values can key maps and sets directly, and a handful of `const fn`
//! constructors so they fold at compile time in tests.

use std::fmt;

/// A replica identity in `0..group_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaId(u8);

impl ReplicaId {
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A view (ballot/epoch) number. Leader(v) = v mod group_size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Leader replica for this view in a group of `group_size` replicas.
    #[must_use]
    pub fn leader(self, group_size: usize) -> ReplicaId {
        debug_assert!(group_size > 0, "group_size must be non-zero");
        ReplicaId::new((self.0 % group_size as u64) as u8)
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A dense, monotonically assigned consensus slot identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InstanceId(u64);

impl InstanceId {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// A client-assigned request identity, opaque to the engine beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId {
    pub client_id: u64,
    pub sequence_no: u64,
}

impl RequestId {
    #[must_use]
    pub const fn new(client_id: u64, sequence_no: u64) -> Self {
        Self {
            client_id,
            sequence_no,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{})", self.client_id, self.sequence_no)
    }
}

/// An opaque client request: a stable id plus an opaque, self-delimiting
/// payload. The engine never interprets the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

impl Request {
    #[must_use]
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }
}

/// Returns the quorum size (strict majority) for a group of `group_size`
/// replicas: the smallest `q` with `q > group_size / 2`.
#[must_use]
pub const fn quorum_size(group_size: usize) -> usize {
    group_size / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn leader_wraps_around_view() {
        assert_eq!(ViewNumber::new(0).leader(3), ReplicaId::new(0));
        assert_eq!(ViewNumber::new(1).leader(3), ReplicaId::new(1));
        assert_eq!(ViewNumber::new(3).leader(3), ReplicaId::new(0));
        assert_eq!(ViewNumber::new(4).leader(3), ReplicaId::new(1));
    }

    #[test_case(1, 1)]
    #[test_case(3, 2)]
    #[test_case(5, 3)]
    #[test_case(7, 4)]
    fn quorum_sizes_match_majority(group_size: usize, expected: usize) {
        assert_eq!(quorum_size(group_size), expected);
    }

    #[test]
    fn instance_id_next_is_dense() {
        let a = InstanceId::new(5);
        assert_eq!(a.next(), InstanceId::new(6));
        assert!(InstanceId::ZERO.is_zero());
        assert!(!a.is_zero());
    }
}
