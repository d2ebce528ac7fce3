//! Scenario 1 (§8): a single client request submitted to the view-0 leader
//! is proposed, accepted by a quorum, and delivered to every replica's
//! service in order.

mod support;

use paxos_core::types::{InstanceId, ReplicaId, Request, RequestId};
use support::Cluster;

#[test]
fn happy_commit_decides_and_delivers_on_every_replica() {
    let mut cluster = Cluster::new(3);

    let request = Request::new(RequestId::new(1, 1), b"x".to_vec());
    cluster.propose(0, request);

    for (i, dispatcher) in cluster.dispatchers.iter().enumerate() {
        let status = dispatcher.engine().status();
        assert_eq!(status.first_uncommitted, InstanceId::new(1), "replica {i} should have committed instance 0");
        assert_eq!(dispatcher.service().executed.len(), 1, "replica {i} should have executed instance 0");
        let (id, payload) = &dispatcher.service().executed[0];
        assert_eq!(*id, InstanceId::ZERO);
        // A 4-byte count prefix (1 request in the batch) followed by the
        // request's raw payload.
        assert_eq!(&payload[0..4], &1u32.to_be_bytes());
        assert_eq!(&payload[4..], b"x");
    }

    let leader = &cluster.dispatchers[0];
    assert_eq!(leader.engine().view(), paxos_core::types::ViewNumber::ZERO);
    assert!(leader.engine().is_leader());
    assert_eq!(leader.engine().leader(), ReplicaId::new(0));
}

#[test]
fn followers_never_propose() {
    let mut cluster = Cluster::new(3);
    let request = Request::new(RequestId::new(1, 1), b"ignored".to_vec());

    // Submitted directly to a follower: refused, nothing is ever decided.
    cluster.propose(1, request);

    for dispatcher in &cluster.dispatchers {
        assert_eq!(dispatcher.engine().status().log_len, 0);
    }
}
