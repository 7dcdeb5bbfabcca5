//! File-locked JSON registries used for process rendezvous.
//!
//! `qpus.json` and `communications.json` are plain JSON objects keyed by
//! `"<job_id>_<task_pid>[_<suffix>]"`. Processes are launched independently
//! by the batch scheduler and have no other way to find each other, so the
//! registry is the entire discovery mechanism: a writer opens the file,
//! takes an exclusive whole-file advisory lock, reads whatever is there
//! (treating an empty file or a parse error as an empty object), mutates it
//! in memory, truncates, writes the new JSON back, and fsyncs before
//! releasing the lock. Readers that only need a snapshot (the CC rewrite
//! path) take a shared lock for the same reason: it rules out observing a
//! write in progress.
//!
//! Every writer goes through the same two operations, [`write_entry`] and
//! [`remove_by_prefix`], so the locking protocol lives in exactly one place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logging::{log_event, LogCategory};
use crate::{QpuMeshError, Result};

/// Bind-mode recorded in a `qpus.json` entry's `net` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetMode {
    /// Bind to `tcp://127.0.0.1:*`.
    Hpc,
    /// Bind to the highest-link-speed local IPv4 address.
    CoLocated,
}

/// `net` field of a `qpus.json` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetInfo {
    pub mode: NetMode,
    pub nodename: String,
    pub endpoint: String,
}

/// Value stored under a key in `qpus.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QpuEntry {
    pub backend: Value,
    pub net: NetInfo,
    pub name: String,
    pub family: String,
    pub slurm_job_id: String,
}

/// Value stored under a key in `communications.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsEntry {
    pub communications_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_endpoint: Option<String>,
}

/// Write `entry` under `"<job_id>_<task_pid>[_<suffix>]"` into the JSON
/// object at `path`, creating the file if absent. The whole operation —
/// open, lock, read, mutate, truncate, write, fsync, unlock — is performed
/// under one exclusive lock so concurrent writers serialize.
pub fn write_entry<T: Serialize>(path: &Path, key: &str, entry: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| QpuMeshError::Registry(format!("opening {}: {e}", path.display())))?;

    file.lock_exclusive()
        .map_err(|e| QpuMeshError::Registry(format!("locking {}: {e}", path.display())))?;

    let result = (|| -> Result<()> {
        let mut obj = read_object_locked(&mut file)?;
        let value = serde_json::to_value(entry)?;
        obj.insert(key.to_string(), value);
        write_object_locked(&mut file, &obj)
    })();

    let _ = file.unlock();
    result?;

    log_event(
        LogCategory::System,
        &format!("registry write: {} <- key {key}", path.display()),
    );
    Ok(())
}

/// Remove every key starting with `prefix` from the JSON object at `path`.
/// A missing file is treated as already-empty: the operation is a no-op,
/// not an error, so `qdrop`-style cleanup is idempotent.
pub fn remove_by_prefix(path: &Path, prefix: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| QpuMeshError::Registry(format!("opening {}: {e}", path.display())))?;

    file.lock_exclusive()
        .map_err(|e| QpuMeshError::Registry(format!("locking {}: {e}", path.display())))?;

    let result = (|| -> Result<()> {
        let mut obj = read_object_locked(&mut file)?;
        obj.retain(|k, _| !k.starts_with(prefix));
        write_object_locked(&mut file, &obj)
    })();

    let _ = file.unlock();
    result?;

    log_event(
        LogCategory::System,
        &format!("registry prune: {} prefix {prefix}", path.display()),
    );
    Ok(())
}

/// Read a snapshot of the JSON object at `path` under a shared lock. Used by
/// the CC ingress rewrite path, which only needs a consistent read, not a
/// read-modify-write.
pub fn read_snapshot(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }

    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| QpuMeshError::Registry(format!("opening {}: {e}", path.display())))?;

    file.lock_shared()
        .map_err(|e| QpuMeshError::Registry(format!("locking {}: {e}", path.display())))?;

    let result = read_object_locked(&mut file);
    let _ = file.unlock();
    result
}

/// Read the communications registry and look up `peer_id`, returning a
/// registry-shaped error (never a panic) if the peer is unknown.
pub fn lookup_comms_entry(path: &Path, peer_id: &str) -> Result<CommsEntry> {
    let snapshot = read_snapshot(path)?;
    let value = snapshot
        .get(peer_id)
        .ok_or_else(|| QpuMeshError::PeerNotFound(peer_id.to_string()))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn read_object_locked(file: &mut File) -> Result<Map<String, Value>> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    if contents.trim().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(obj)) => Ok(obj),
        _ => Ok(Map::new()),
    }
}

fn write_object_locked(file: &mut File, obj: &Map<String, Value>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(&Value::Object(obj.clone()))?;

    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)
        .map_err(|e| QpuMeshError::Registry(format!("truncating: {e}")))?;
    file.write_all(rendered.as_bytes())?;
    file.sync_all()
        .map_err(|e| QpuMeshError::Registry(format!("fsync: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qpus.json");

        let entry = QpuEntry {
            backend: serde_json::json!({"name": "statevector"}),
            net: NetInfo {
                mode: NetMode::Hpc,
                nodename: "login".to_string(),
                endpoint: "tcp://127.0.0.1:5000".to_string(),
            },
            name: "qpu0".to_string(),
            family: "fam".to_string(),
            slurm_job_id: "42".to_string(),
        };

        write_entry(&path, "42_1", &entry).unwrap();

        let snapshot = read_snapshot(&path).unwrap();
        assert!(snapshot.contains_key("42_1"));
        let parsed: QpuEntry = serde_json::from_value(snapshot["42_1"].clone()).unwrap();
        assert_eq!(parsed.name, "qpu0");
    }

    #[test]
    fn remove_by_prefix_deletes_matching_keys_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qpus.json");

        let entry = CommsEntry {
            communications_endpoint: "tcp://x:1".to_string(),
            executor_endpoint: None,
        };
        write_entry(&path, "42_1", &entry).unwrap();
        write_entry(&path, "42_2", &entry).unwrap();
        write_entry(&path, "7_1", &entry).unwrap();

        remove_by_prefix(&path, "42_").unwrap();

        let snapshot = read_snapshot(&path).unwrap();
        assert!(!snapshot.contains_key("42_1"));
        assert!(!snapshot.contains_key("42_2"));
        assert!(snapshot.contains_key("7_1"));
    }

    #[test]
    fn missing_peer_is_a_peer_not_found_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("communications.json");
        let err = lookup_comms_entry(&path, "ghost").unwrap_err();
        assert!(matches!(err, QpuMeshError::PeerNotFound(p) if p == "ghost"));
    }

    #[test]
    fn concurrent_writers_all_land() {
        let dir = tempdir().unwrap();
        let path = Arc::new(dir.path().join("qpus.json"));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let path = Arc::clone(&path);
                thread::spawn(move || {
                    let entry = CommsEntry {
                        communications_endpoint: format!("tcp://host:{i}"),
                        executor_endpoint: None,
                    };
                    write_entry(&path, &format!("job_{i}"), &entry).unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.len(), 16);
        for i in 0..16 {
            assert!(snapshot.contains_key(&format!("job_{i}")));
        }
    }
}
