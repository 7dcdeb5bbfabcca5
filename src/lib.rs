//! # QPU Mesh
//!
//! A distributed execution substrate for quantum processing units (QPUs)
//! spread across HPC compute nodes. Clients submit circuits to a QPU's
//! client-facing socket; QPUs participating in a classical-communication
//! (CC) circuit exchange runtime measurements over a peer-to-peer classical
//! channel; an executor process variant fans circuits in and out for
//! simulator backends that cannot themselves speak to peers.
//!
//! Two JSON registries (`qpus.json`, `communications.json`) on a shared
//! filesystem let independently-launched processes find each other. This
//! crate owns that rendezvous mechanism, the network plumbing, and the task
//! transport/rewrite pipeline. The numerical kernel that actually simulates
//! a circuit is an external collaborator behind the [`backend::Kernel`]
//! trait.
//!
//! ## Architecture
//!
//! - [`registry`] — file-locked JSON registries used for process discovery.
//! - [`client_socket`] — the QPU's client-facing request/reply socket.
//! - [`classical_channel`] — the peer-to-peer router/dealer mesh.
//! - [`task`] — `QuantumTask` transport, parameter rebinding, peer-id rewrite.
//! - [`backend`] — the Simple / CC / QC execution strategies.
//! - [`qpu_server`] — the two-thread QPU process loop.
//! - [`executor`] — the group fan-in/fan-out process for QC circuits.
//!
//! Ambient production modules: [`config`], [`error_handling`], [`logging`],
//! [`production_monitor`].
//!
//! ## Non-goals
//!
//! This crate makes no claim about the numerical correctness of any quantum
//! simulation, does not schedule work across QPUs, does not authenticate or
//! encrypt the wire protocol, does not persist results beyond the call that
//! produced them, and does not recover in-flight tasks across a crash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backend;
pub mod classical_channel;
pub mod client_socket;
pub mod config;
pub mod error_handling;
pub mod executor;
pub mod logging;
pub mod production_monitor;
pub mod qpu_server;
pub mod registry;
pub mod task;

/// Crate-wide error type. One variant per failure kind recognised by the
/// error-handling design: transport, protocol, registry, kernel, and
/// configuration errors, plus two refinements: a missing peer is a
/// registry-shaped error rather than a panic, and arity mismatches are a
/// distinct protocol error so callers can render a precise message.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum QpuMeshError {
    /// A peer socket failed to send or receive. Recoverable by the caller:
    /// the client-socket listen loop treats it as a session close.
    #[error("transport error: {0}")]
    Transport(String),

    /// A malformed task, a send to an unregistered peer, or a parameter
    /// arity mismatch. The offending task becomes an `{"ERROR": ...}` reply;
    /// the QPU process keeps running.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A registry open/lock/read/write/truncate/fsync failure. Fatal for the
    /// operation in progress; never leaves a partially-written registry file
    /// observable to another reader.
    #[error("registry error: {0}")]
    Registry(String),

    /// The numerical kernel raised an error while executing a task.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// A process failed to start: unrecognised simulator name, malformed
    /// environment, or a node-list / memory-format mismatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `sending_to` or `qpus` entry named a peer with no communications
    /// registry entry. Surfaced as a protocol-shaped reply, not a teardown.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The parameter vector of a `{"params": [...]}` rebind message did not
    /// match the gate-arity sum of the circuit it targets.
    #[error("parameter arity mismatch: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("io error: {0}")]
    Io(String),

    #[error("json error: {0}")]
    Json(String),
}

impl From<std::io::Error> for QpuMeshError {
    fn from(e: std::io::Error) -> Self {
        QpuMeshError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for QpuMeshError {
    fn from(e: serde_json::Error) -> Self {
        QpuMeshError::Json(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QpuMeshError>;
