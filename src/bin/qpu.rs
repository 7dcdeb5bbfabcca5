//! Thin QPU process entry point: reads configuration from the batch
//! scheduler environment, binds the client socket and (if enabled) the
//! classical channel, and blocks on the worker threads for the life of the
//! process.
//!
//! The numerical kernel is this system's one true external collaborator —
//! this binary wires up a placeholder that returns an empty counts map so
//! the process is runnable end-to-end; a real deployment substitutes its
//! own [`qpu_mesh::backend::Kernel`] implementation here.

use std::env;
use std::sync::Arc;

use serde_json::{json, Value};

use qpu_mesh::backend::{Backend, Kernel};
use qpu_mesh::classical_channel::ClassicalChannel;
use qpu_mesh::client_socket::ClientSocket;
use qpu_mesh::config::{QpuConfig, RuntimeConfig};
use qpu_mesh::logging::{self, LoggingConfig};
use qpu_mesh::production_monitor::ProductionMonitor;
use qpu_mesh::qpu_server::Qpu;
use qpu_mesh::registry::NetMode;
use qpu_mesh::task::QuantumTask;

struct PlaceholderKernel;

impl Kernel for PlaceholderKernel {
    fn execute(&self, _task: &QuantumTask) -> qpu_mesh::Result<Value> {
        Ok(json!({"results": [{"data": {"counts": {}}}]}))
    }

    fn execute_with_channel(
        &self,
        _task: &QuantumTask,
        _channel: &mut ClassicalChannel,
    ) -> qpu_mesh::Result<Value> {
        Ok(json!({"results": [{"data": {"counts": {}}}]}))
    }
}

fn main() -> qpu_mesh::Result<()> {
    logging::init(&LoggingConfig::default());

    // `ProductionMonitor` spawns a background sampling task on a `tokio`
    // runtime; the QPU worker loop itself stays on plain OS threads. Keep
    // the runtime alive for the life of the process by not dropping it.
    let runtime_handle = tokio::runtime::Runtime::new()
        .map_err(|e| qpu_mesh::QpuMeshError::Configuration(format!("starting tokio runtime: {e}")))?;
    let _enter = runtime_handle.enter();

    let runtime = RuntimeConfig::from_env();
    let net_mode = if env::var("CUNQA_CO_LOCATED").is_ok() {
        NetMode::CoLocated
    } else {
        NetMode::Hpc
    };
    let has_cc = env::var("CUNQA_HAS_CC").is_ok();

    let config = QpuConfig {
        runtime,
        net_mode,
        name: env::var("CUNQA_QPU_NAME").unwrap_or_else(|_| "qpu0".to_string()),
        family: env::var("CUNQA_QPU_FAMILY").unwrap_or_else(|_| "default".to_string()),
        backend_config: json!({"name": "statevector"}),
    };

    let client_socket = ClientSocket::bind(config.net_mode)?;
    let channel = if has_cc {
        Some(ClassicalChannel::bind("0.0.0.0:0", &config.runtime.registry_key(None))?)
    } else {
        None
    };

    let backend = if has_cc {
        Backend::Cc(Arc::new(PlaceholderKernel))
    } else {
        Backend::Simple(Arc::new(PlaceholderKernel))
    };

    let monitor = Arc::new(ProductionMonitor::new());
    let qpu = Qpu::new(config, backend, client_socket, channel, monitor);
    qpu.turn_on()
}
