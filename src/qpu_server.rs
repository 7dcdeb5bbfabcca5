//! The QPU process loop: exactly one listen thread and one compute thread,
//! synchronized through a single mutex-and-condvar message queue — no
//! user-space runtime, per the concurrency model this system is built
//! around. `turn_on` blocks the caller (the process main thread) on both
//! worker threads for the lifetime of the QPU.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::json;

use crate::backend::Backend;
use crate::classical_channel::ClassicalChannel;
use crate::client_socket::{ClientSocket, CLOSE_SENTINEL};
use crate::config::QpuConfig;
use crate::logging::{log_error, log_event, LogCategory};
use crate::production_monitor::ProductionMonitor;
use crate::registry::{NetInfo, QpuEntry};
use crate::task::{rebind_params, rewrite_peer_ids, IncomingMessage, QuantumTask};
use crate::{QpuMeshError, Result};

struct QueueState {
    queue: Mutex<VecDeque<String>>,
    condvar: Condvar,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
        }
    }

    fn push(&self, message: String) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(message);
        self.condvar.notify_one();
    }

    /// Block until the queue is non-empty, then pop one message.
    fn pop_blocking(&self) -> String {
        let mut queue = self.queue.lock().unwrap();
        while queue.is_empty() {
            queue = self.condvar.wait(queue).unwrap();
        }
        queue.pop_front().expect("queue non-empty under lock")
    }
}

/// A running QPU: a backend, a client socket, an optional classical
/// channel (present whenever CC is enabled), and the message queue that
/// hands work from the listen thread to the compute thread.
pub struct Qpu {
    backend: Backend,
    client_socket: Arc<ClientSocket>,
    channel: Option<ClassicalChannel>,
    queue: Arc<QueueState>,
    config: QpuConfig,
    comms_registry_path: PathBuf,
    qpus_registry_path: PathBuf,
    monitor: Arc<ProductionMonitor>,
}

impl Qpu {
    pub fn new(
        config: QpuConfig,
        backend: Backend,
        client_socket: ClientSocket,
        channel: Option<ClassicalChannel>,
        monitor: Arc<ProductionMonitor>,
    ) -> Self {
        let comms_registry_path = config.runtime.communications_registry_path();
        let qpus_registry_path = config.runtime.qpus_registry_path();
        Self {
            backend,
            client_socket: Arc::new(client_socket),
            channel,
            queue: Arc::new(QueueState::new()),
            config,
            comms_registry_path,
            qpus_registry_path,
            monitor,
        }
    }

    /// Write this QPU's registry entry, start the listen and compute
    /// threads, and block until both exit (which in normal operation is
    /// never — a QPU runs until the process is terminated).
    pub fn turn_on(mut self) -> Result<()> {
        self.publish_qpu_entry()?;
        if let Some(channel) = self.channel.as_ref() {
            channel.publish(&self.comms_registry_path, &self.config.runtime.registry_key(None))?;
        }

        log_event(
            LogCategory::System,
            &format!(
                "QPU {} turned on at {}",
                self.config.name,
                self.client_socket.bound_endpoint()
            ),
        );

        let listen_handle = self.spawn_listen_thread();
        let compute_handle = self.spawn_compute_thread();

        listen_handle
            .join()
            .map_err(|_| QpuMeshError::Transport("listen thread panicked".to_string()))?;
        compute_handle
            .join()
            .map_err(|_| QpuMeshError::Transport("compute thread panicked".to_string()))?;
        Ok(())
    }

    fn publish_qpu_entry(&self) -> Result<()> {
        let entry = QpuEntry {
            backend: self.config.backend_config.clone(),
            net: NetInfo {
                mode: self.config.net_mode,
                nodename: self.config.runtime.node_name.clone(),
                endpoint: self.client_socket.bound_endpoint().to_string(),
            },
            name: self.config.name.clone(),
            family: self.config.family.clone(),
            slurm_job_id: self.config.runtime.job_id.clone(),
        };
        crate::registry::write_entry(&self.qpus_registry_path, &self.config.runtime.registry_key(None), &entry)
    }

    /// The listen thread owns receiving: it blocks in `recv_data` on its
    /// `Arc<ClientSocket>` while the compute thread independently calls
    /// `send_result` through its own clone of the same `Arc`. Both methods
    /// take `&self`, so no mutex ever spans the blocking receive and the
    /// reply send — a reply for the request currently being computed goes
    /// out immediately rather than waiting on the next inbound message.
    fn spawn_listen_thread(&self) -> JoinHandle<()> {
        let client_socket = Arc::clone(&self.client_socket);
        let queue = Arc::clone(&self.queue);

        thread::spawn(move || loop {
            let message = client_socket.recv_data();
            if message == CLOSE_SENTINEL {
                log_error(LogCategory::Network, "malformed frame or socket error, dropping");
                continue;
            }
            queue.push(message);
        })
    }

    fn spawn_compute_thread(self) -> JoinHandle<()> {
        let Qpu {
            backend,
            client_socket,
            mut channel,
            queue,
            config,
            comms_registry_path,
            monitor,
            ..
        } = self;

        thread::spawn(move || {
            let mut last_circuit: Option<QuantumTask> = None;

            loop {
                let raw = queue.pop_blocking();
                let started = std::time::Instant::now();

                let outcome = process_one_message(
                    &raw,
                    &mut last_circuit,
                    &backend,
                    channel.as_mut(),
                    &comms_registry_path,
                    &config,
                );

                let reply = match outcome {
                    Ok(reply) => {
                        monitor.record_task(started.elapsed(), true);
                        reply
                    }
                    Err(e) => {
                        monitor.record_task(started.elapsed(), false);
                        log_error(LogCategory::Queue, &format!("task failed: {e}"));
                        json!({"ERROR": e.to_string()}).to_string()
                    }
                };

                if let Err(e) = client_socket.send_result(&reply) {
                    // Peer gone: log and drop the reply, the QPU keeps running.
                    log_error(LogCategory::Network, &format!("reply send failed, dropping: {e}"));
                }
            }
        })
    }
}

fn process_one_message(
    raw: &str,
    last_circuit: &mut Option<QuantumTask>,
    backend: &Backend,
    channel: Option<&mut ClassicalChannel>,
    comms_registry_path: &std::path::Path,
    config: &QpuConfig,
) -> Result<String> {
    match IncomingMessage::parse(raw)? {
        IncomingMessage::Task(mut task) => {
            rewrite_peer_ids(&mut task, comms_registry_path)?;
            let result = backend.execute(&task, channel)?;
            *last_circuit = Some(task);
            let _ = &config.name;
            Ok(result.to_string())
        }
        IncomingMessage::ParamUpdate(update) => {
            let circuit = last_circuit
                .as_mut()
                .ok_or_else(|| QpuMeshError::Protocol("params update with no prior circuit".to_string()))?;
            rebind_params(&mut circuit.instructions, &update.params)?;
            Ok(json!({"status": "ok"}).to_string())
        }
    }
}
