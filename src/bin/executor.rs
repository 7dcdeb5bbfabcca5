//! Thin executor process entry point: builds a classical channel identified
//! as `"executor"`, connects to every QPU in its group via the
//! communications registry, then serves fan-in/fan-out rounds forever.

use std::env;
use std::sync::Arc;

use serde_json::{json, Value};

use qpu_mesh::backend::Kernel;
use qpu_mesh::classical_channel::ClassicalChannel;
use qpu_mesh::config::RuntimeConfig;
use qpu_mesh::executor::{Executor, JointKernel};
use qpu_mesh::logging::{self, LoggingConfig};
use qpu_mesh::task::QuantumTask;

/// Stands in for the real numerical kernel, which this crate treats as an
/// external collaborator; a production deployment supplies its own joint
/// simulation here.
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

impl JointKernel for PlaceholderKernel {
    fn execute_joint(
        &self,
        _tasks: &[QuantumTask],
        _channel: &mut ClassicalChannel,
    ) -> qpu_mesh::Result<Value> {
        Ok(json!({"results": [{"data": {"counts": {}}}]}))
    }
}

fn main() -> qpu_mesh::Result<()> {
    logging::init(&LoggingConfig::default());

    let runtime = RuntimeConfig::from_env();
    let group_id = env::var("CUNQA_GROUP_ID").unwrap_or_else(|_| runtime.job_id.clone());

    let mut executor = Executor::bind(
        "0.0.0.0:0",
        &runtime.communications_registry_path(),
        &group_id,
        Arc::new(PlaceholderKernel),
    )?;

    executor.serve_forever();
}
