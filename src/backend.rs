//! Backend execution strategies: Simple, CC, and QC.
//!
//! A backend is a thin adapter in front of the numerical kernel — the
//! simulator that actually runs a circuit and is treated as an opaque
//! collaborator behind the [`Kernel`] trait. The three variants differ only
//! in how (and whether) they touch the classical channel before handing the
//! task to the kernel; the kernel itself never knows which variant invoked
//! it except through the optional channel argument.

use std::sync::Arc;

use serde_json::Value;

use crate::classical_channel::ClassicalChannel;
use crate::task::QuantumTask;
use crate::{QpuMeshError, Result};

/// The external numerical simulator. Out of scope for this crate: an
/// implementation might shell out to AER, drive a state-vector simulator in
/// process, or call a decision-diagram engine. This crate only needs the
/// two entry points a backend strategy can call.
pub trait Kernel: Send + Sync {
    /// Execute `task` with no classical-channel access.
    fn execute(&self, task: &QuantumTask) -> Result<Value>;

    /// Execute `task` with the classical channel available, so the kernel
    /// can call `send_measure`/`recv_measure` mid-circuit for dynamic
    /// (`is_dynamic`) execution.
    fn execute_with_channel(&self, task: &QuantumTask, channel: &mut ClassicalChannel) -> Result<Value>;
}

/// Execution strategy selected at QPU construction time.
pub enum Backend {
    /// Hands the task straight to the kernel; no peer interaction.
    Simple(Arc<dyn Kernel>),
    /// Connects to every peer in `sending_to` before executing, so the
    /// kernel can exchange measurements mid-circuit when `is_dynamic`.
    Cc(Arc<dyn Kernel>),
    /// Delegates the whole circuit to an external executor process over the
    /// classical channel (AER-only path).
    Qc(Arc<dyn Kernel>),
}

impl Backend {
    /// Run `task` to completion, returning the normalized result JSON
    /// (`{"results":[{"data":{"counts": {...}}}]}` with binary count keys).
    /// `channel` is only required for the `Cc` and `Qc` variants; `Simple`
    /// never touches it.
    pub fn execute(&self, task: &QuantumTask, channel: Option<&mut ClassicalChannel>) -> Result<Value> {
        let raw = match self {
            Backend::Simple(kernel) => kernel.execute(task)?,
            Backend::Cc(kernel) => {
                let channel = channel.ok_or_else(|| {
                    QpuMeshError::Configuration("CC backend requires a classical channel".to_string())
                })?;
                for target in &task.sending_to {
                    channel.connect_force_endpoint(target, target)?;
                }
                if task.is_dynamic {
                    kernel.execute_with_channel(task, channel)?
                } else {
                    kernel.execute(task)?
                }
            }
            Backend::Qc(_kernel) => {
                let channel = channel.ok_or_else(|| {
                    QpuMeshError::Configuration("QC backend requires a classical channel".to_string())
                })?;
                let circuit = serde_json::to_string(task)?;
                channel.send_info(&circuit, "executor")?;
                let reply = channel.recv_info("executor")?;
                serde_json::from_str(&reply)?
            }
        };

        normalize_counts(raw, num_clbits(task))
    }
}

fn num_clbits(task: &QuantumTask) -> usize {
    task.config
        .get("num_clbits")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

/// Rewrite every count key under `results[].data.counts` from AER's
/// hex-encoded form into a fixed-width binary string, MSB first, matching
/// Qiskit convention. Keys already in binary form (no leading `0x` and only
/// `0`/`1` characters) are left as-is so this is safe to call on results
/// from kernels that already produce binary keys.
fn normalize_counts(mut result: Value, num_clbits: usize) -> Result<Value> {
    let Some(results) = result.get_mut("results").and_then(Value::as_array_mut) else {
        return Ok(result);
    };

    for entry in results.iter_mut() {
        let Some(counts) = entry
            .get_mut("data")
            .and_then(|d| d.get_mut("counts"))
            .and_then(Value::as_object_mut)
        else {
            continue;
        };

        let rewritten: serde_json::Map<String, Value> = std::mem::take(counts)
            .into_iter()
            .map(|(key, value)| (to_binary_key(&key, num_clbits), value))
            .collect();
        *counts = rewritten;
    }

    Ok(result)
}

fn to_binary_key(key: &str, num_clbits: usize) -> String {
    if let Some(hex) = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        if let Ok(value) = u64::from_str_radix(hex, 16) {
            return format!("{value:0width$b}", width = num_clbits);
        }
    }
    key.to_string()
}

/// A kernel error wraps whatever the numerical backend reports, never a
/// panic — `qpu_server` turns this into an `{"ERROR": ...}` reply.
pub fn kernel_error(message: impl Into<String>) -> QpuMeshError {
    QpuMeshError::Kernel(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_key_becomes_fixed_width_binary() {
        assert_eq!(to_binary_key("0x3", 4), "0011");
        assert_eq!(to_binary_key("0x0", 2), "00");
    }

    #[test]
    fn already_binary_key_is_unchanged() {
        assert_eq!(to_binary_key("1010", 4), "1010");
    }

    #[test]
    fn normalize_counts_rewrites_hex_keys() {
        let raw = serde_json::json!({
            "results": [{"data": {"counts": {"0x0": 512, "0x3": 488}}}]
        });
        let normalized = normalize_counts(raw, 2).unwrap();
        let counts = &normalized["results"][0]["data"]["counts"];
        assert_eq!(counts.get("00"), Some(&Value::from(512)));
        assert_eq!(counts.get("11"), Some(&Value::from(488)));
    }
}
