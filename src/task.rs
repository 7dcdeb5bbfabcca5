//! `QuantumTask` wire format, ingress peer-id rewrite, and parameter rebinding.
//!
//! A QPU receives one JSON document per client message. Most are full
//! [`QuantumTask`]s; a message containing only `params` instead is a
//! [`ParamUpdate`] that rebinds gate parameters on the last circuit the QPU
//! saw. Both are handled here so `qpu_server` only has to call
//! [`IncomingMessage::parse`] and match on the result.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::lookup_comms_entry;
use crate::{QpuMeshError, Result};

/// One instruction in a circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub name: String,
    pub qubits: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clbits: Option<Vec<u32>>,
    /// Peer routing for CC circuits: logical ids on ingress, concrete
    /// `tcp://` endpoints after [`rewrite_peer_ids`] runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qpus: Option<Vec<String>>,
}

/// The unit of submission to a QPU's client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumTask {
    pub id: String,
    pub config: Value,
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub sending_to: Vec<String>,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub has_cc: bool,
}

/// `{"params": [...]}` — rebinds gate parameters on the previously received
/// circuit in place.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamUpdate {
    pub params: Vec<f64>,
}

/// Result of parsing one client message.
pub enum IncomingMessage {
    Task(QuantumTask),
    ParamUpdate(ParamUpdate),
}

impl IncomingMessage {
    /// Parse a raw client payload. A document with an `instructions` field
    /// is a full task; one with only `params` is a rebind.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| QpuMeshError::Protocol(format!("malformed task JSON: {e}")))?;

        if value.get("instructions").is_some() {
            let task: QuantumTask = serde_json::from_value(value)
                .map_err(|e| QpuMeshError::Protocol(format!("malformed task: {e}")))?;
            Ok(IncomingMessage::Task(task))
        } else if value.get("params").is_some() {
            let update: ParamUpdate = serde_json::from_value(value)
                .map_err(|e| QpuMeshError::Protocol(format!("malformed params update: {e}")))?;
            Ok(IncomingMessage::ParamUpdate(update))
        } else {
            Err(QpuMeshError::Protocol(
                "message has neither `instructions` nor `params`".to_string(),
            ))
        }
    }
}

/// Number of floats a parametric gate consumes. Unlisted gates consume 0.
fn gate_arity(name: &str) -> usize {
    match name {
        "rx" | "ry" | "rz" => 1,
        "r" => 2,
        "u" | "cu" => 3,
        _ => 0,
    }
}

/// Sum of parameter arities across `instructions`, the expected length of a
/// [`ParamUpdate::params`] targeting this circuit.
pub fn total_arity(instructions: &[Instruction]) -> usize {
    instructions.iter().map(|i| gate_arity(&i.name)).sum()
}

/// Apply a parameter rebind to `instructions` in place, positionally over
/// the parametric gates in circuit order. Fails with [`QpuMeshError::ArityMismatch`]
/// if `params.len()` does not equal [`total_arity`] — never truncates or
/// silently drops the remainder.
pub fn rebind_params(instructions: &mut [Instruction], params: &[f64]) -> Result<()> {
    let expected = total_arity(instructions);
    if params.len() != expected {
        return Err(QpuMeshError::ArityMismatch {
            expected,
            got: params.len(),
        });
    }

    let mut cursor = 0usize;
    for instruction in instructions.iter_mut() {
        let arity = gate_arity(&instruction.name);
        if arity == 0 {
            continue;
        }
        instruction.params = Some(params[cursor..cursor + arity].to_vec());
        cursor += arity;
    }
    Ok(())
}

/// Rewrite every logical peer id in `task` to a concrete `tcp://` endpoint,
/// resolved against the communications registry at `comms_path`. Runs
/// exactly once, on ingress, before the backend ever sees the task.
///
/// A `qpus` entry prefers the peer's `executor_endpoint`; `sending_to`
/// always resolves to `communications_endpoint`. A missing peer id is a
/// [`QpuMeshError::PeerNotFound`], which `qpu_server` turns into an
/// `{"ERROR": ...}` reply rather than tearing down the compute thread.
pub fn rewrite_peer_ids(task: &mut QuantumTask, comms_path: &Path) -> Result<()> {
    if !task.has_cc {
        return Ok(());
    }

    let mut resolved: HashMap<String, String> = HashMap::new();

    for instruction in task.instructions.iter_mut() {
        if let Some(peers) = instruction.qpus.as_mut() {
            for peer in peers.iter_mut() {
                if peer.starts_with("tcp://") {
                    continue;
                }
                let endpoint = resolve_qpus_entry(peer, comms_path, &mut resolved)?;
                *peer = endpoint;
            }
        }
    }

    for peer in task.sending_to.iter_mut() {
        if peer.starts_with("tcp://") {
            continue;
        }
        let endpoint = resolve_sending_to_entry(peer, comms_path, &mut resolved)?;
        *peer = endpoint;
    }

    Ok(())
}

fn resolve_qpus_entry(
    peer_id: &str,
    comms_path: &Path,
    cache: &mut HashMap<String, String>,
) -> Result<String> {
    if let Some(cached) = cache.get(peer_id) {
        return Ok(cached.clone());
    }
    let entry = lookup_comms_entry(comms_path, peer_id)?;
    let endpoint = entry
        .executor_endpoint
        .unwrap_or(entry.communications_endpoint);
    cache.insert(peer_id.to_string(), endpoint.clone());
    Ok(endpoint)
}

fn resolve_sending_to_entry(
    peer_id: &str,
    comms_path: &Path,
    cache: &mut HashMap<String, String>,
) -> Result<String> {
    if let Some(cached) = cache.get(peer_id) {
        return Ok(cached.clone());
    }
    let entry = lookup_comms_entry(comms_path, peer_id)?;
    cache.insert(peer_id.to_string(), entry.communications_endpoint.clone());
    Ok(entry.communications_endpoint)
}
