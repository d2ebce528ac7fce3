//! Crash-recovery state-machine replication built on Multi-Paxos.
//!
//! The crate is organized the way the design's component table (§2) lists
//! its pieces: a replicated [`log`] of consensus instances durable through
//! [`storage`], driven by the Paxos [`roles`] (Acceptor/Learner/Proposer)
//! plus the snapshot/catch-up subprotocol, wired together by a
//! single-threaded [`dispatcher`] that crosses the [`network`] and
//! [`service`] boundaries. [`message`] is the wire codec; [`config`],
//! [`error`], and [`instrumentation`] are the ambient stack every module
//! leans on.
//!
//! # Example
//!
//! ```no_run
//! use paxos_core::config::EngineConfig;
//! use paxos_core::roles::Engine;
//! use paxos_core::types::ReplicaId;
//!
//! let config = EngineConfig::new(ReplicaId::new(0), 3);
//! let engine = Engine::new(config, 0);
//! assert_eq!(engine.status().log_len, 0);
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failure_detector;
pub mod instrumentation;
pub mod log;
pub mod message;
pub mod network;
pub mod retransmitter;
pub mod roles;
pub mod service;
pub mod storage;
pub mod types;
