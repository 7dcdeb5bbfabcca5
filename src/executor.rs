//! The executor process: fans circuits in from a group of peer QPUs that
//! cannot themselves speak to peers (the AER `Qc` backend path), runs them
//! jointly through the numerical kernel, and fans the shared result back out
//! to every contributor. Single-threaded — a straggler peer is allowed to
//! block a round, since the aggregated simulation requires every
//! participant before it can proceed.

use std::path::Path;

use serde_json::Value;

use crate::backend::Kernel;
use crate::classical_channel::ClassicalChannel;
use crate::logging::{log_event, LogCategory};
use crate::registry::read_snapshot;
use crate::task::QuantumTask;
use crate::{QpuMeshError, Result};

const EXECUTOR_IDENTITY: &str = "executor";

/// One peer QPU this executor fronts.
struct Peer {
    /// Registry key, used only for logging.
    key: String,
    /// The identity this executor addresses the peer's channel by —
    /// its `communications_endpoint`.
    endpoint: String,
}

/// Fans circuits in from a group of QPUs and out again.
pub struct Executor {
    channel: ClassicalChannel,
    peers: Vec<Peer>,
    kernel: std::sync::Arc<dyn JointKernel>,
}

impl Executor {
    /// Build a classical channel identified as `"executor"`, then connect
    /// to every communications-registry entry whose key matches `group_id`
    /// (by job-id prefix, or by `_<group_id>` suffix for group mode),
    /// announcing this executor's own endpoint to each so the QPU's channel
    /// can later address it by the `"executor"` identity.
    pub fn bind(
        bind_addr: &str,
        comms_registry_path: &Path,
        group_id: &str,
        kernel: std::sync::Arc<dyn JointKernel>,
    ) -> Result<Self> {
        let mut channel = ClassicalChannel::bind(bind_addr, EXECUTOR_IDENTITY)?;
        let snapshot = read_snapshot(comms_registry_path)?;

        let mut peers = Vec::new();
        for (key, value) in snapshot.iter() {
            if !(key.starts_with(group_id) || key.ends_with(&format!("_{group_id}"))) {
                continue;
            }
            let Some(endpoint) = value.get("communications_endpoint").and_then(Value::as_str) else {
                continue;
            };
            channel.connect_force_endpoint(endpoint, key)?;
            channel.send_info(channel.bound_endpoint(), key)?;
            peers.push(Peer {
                key: key.clone(),
                endpoint: endpoint.to_string(),
            });
        }

        log_event(
            LogCategory::Network,
            &format!("executor bound for group {group_id}, {} peers", peers.len()),
        );

        Ok(Self {
            channel,
            peers,
            kernel,
        })
    }

    /// Run one fan-in/aggregate/fan-out round. Blocks on every registered
    /// peer in registry-iteration order — a straggler peer blocks the
    /// round, which is intentional: the aggregated simulation needs all
    /// participants.
    pub fn run_round(&mut self) -> Result<()> {
        let mut contributors = Vec::with_capacity(self.peers.len());
        let mut tasks = Vec::with_capacity(self.peers.len());

        for peer in &self.peers {
            let payload = self.channel.recv_info(&peer.key)?;
            if payload.is_empty() {
                continue;
            }
            let task: QuantumTask = serde_json::from_str(&payload).map_err(|e| {
                QpuMeshError::Protocol(format!("malformed task from {}: {e}", peer.key))
            })?;
            tasks.push(task);
            contributors.push(peer.key.clone());
        }

        let result = self.kernel.execute_joint(&tasks, &mut self.channel)?;
        let serialized = result.to_string();

        for key in &contributors {
            self.channel.send_info(&serialized, key)?;
        }
        Ok(())
    }

    /// Run rounds forever. Each round's error is logged and the executor
    /// continues — a single malformed task from one peer shouldn't take
    /// down the whole group's aggregation loop.
    pub fn serve_forever(&mut self) -> ! {
        loop {
            if let Err(e) = self.run_round() {
                crate::logging::log_error(LogCategory::Queue, &format!("executor round failed: {e}"));
            }
        }
    }

    /// Peer registry keys this executor fronts, for diagnostics and tests.
    pub fn peer_keys(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.key.as_str()).collect()
    }

    /// Peer endpoints this executor connected to, for diagnostics and tests.
    pub fn peer_endpoints(&self) -> Vec<&str> {
        self.peers.iter().map(|p| p.endpoint.as_str()).collect()
    }
}

/// Extension of [`Kernel`] the executor needs: running one aggregate
/// computation jointly over every task collected in a round.
pub trait JointKernel: Kernel {
    fn execute_joint(&self, tasks: &[QuantumTask], channel: &mut ClassicalChannel) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubKernel;
    impl Kernel for StubKernel {
        fn execute(&self, _task: &QuantumTask) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
        fn execute_with_channel(&self, _task: &QuantumTask, _channel: &mut ClassicalChannel) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
    }
    impl JointKernel for StubKernel {
        fn execute_joint(&self, _tasks: &[QuantumTask], _channel: &mut ClassicalChannel) -> Result<Value> {
            Ok(serde_json::json!({"results": [{"data": {"counts": {}}}]}))
        }
    }

    #[test]
    fn bind_with_no_matching_peers_is_empty() {
        use tempfile::tempdir;
        let dir = tempdir().unwrap();
        let path = dir.path().join("communications.json");
        let executor = Executor::bind("127.0.0.1:0", &path, "group1", std::sync::Arc::new(StubKernel))
            .unwrap();
        assert!(executor.peer_keys().is_empty());
    }
}
