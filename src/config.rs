//! Process configuration sourced from the batch-scheduler environment.
//!
//! A QPU or executor process is always launched by (or underneath) a batch
//! scheduler, which exports `SLURM_JOB_ID`, `SLURM_TASK_PID`, and
//! `SLURMD_NODENAME`. Registry keys and the `nodename` field of a `qpus.json`
//! entry are derived from these; a missing value falls back to `"UNKNOWN"`
//! (`"login"` for the node name), so a developer running a QPU outside of
//! Slurm still gets a working, if less meaningful, registry key.
//!
//! `dotenvy` is loaded first so a `.env` file in the working directory can
//! stand in for the scheduler environment during local development; real
//! environment variables always take precedence over it.

use std::path::PathBuf;

use crate::registry::NetMode;

const DEFAULT_STATE_DIRNAME: &str = ".cunqa_state";

/// Runtime configuration for a QPU or executor process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for the shared registries (`$STORE/.cunqa`).
    pub store_dir: PathBuf,
    /// `SLURM_JOB_ID`, or `"UNKNOWN"`.
    pub job_id: String,
    /// `SLURM_TASK_PID`, or `"UNKNOWN"`.
    pub task_pid: String,
    /// `SLURMD_NODENAME`, or `"login"`.
    pub node_name: String,
}

impl RuntimeConfig {
    /// Load configuration from the process environment, applying a `.env`
    /// file (if present) before reading real environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let store_root = std::env::var("STORE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default());

        Self {
            store_dir: store_root.join(DEFAULT_STATE_DIRNAME),
            job_id: std::env::var("SLURM_JOB_ID").unwrap_or_else(|_| "UNKNOWN".to_string()),
            task_pid: std::env::var("SLURM_TASK_PID").unwrap_or_else(|_| "UNKNOWN".to_string()),
            node_name: std::env::var("SLURMD_NODENAME").unwrap_or_else(|_| "login".to_string()),
        }
    }

    /// Path to the QPU registry file.
    pub fn qpus_registry_path(&self) -> PathBuf {
        self.store_dir.join("qpus.json")
    }

    /// Path to the classical-communications registry file.
    pub fn communications_registry_path(&self) -> PathBuf {
        self.store_dir.join("communications.json")
    }

    /// Registry key for this process: `"<job_id>_<task_pid>[_<suffix>]"`.
    pub fn registry_key(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(s) if !s.is_empty() => format!("{}_{}_{}", self.job_id, self.task_pid, s),
            _ => format!("{}_{}", self.job_id, self.task_pid),
        }
    }
}

/// Construction-time configuration for a QPU's client socket.
#[derive(Debug, Clone)]
pub struct QpuConfig {
    pub runtime: RuntimeConfig,
    pub net_mode: NetMode,
    pub name: String,
    pub family: String,
    pub backend_config: serde_json::Value,
}
