//! End-to-end scenarios exercising the full submission → backend →
//! result pipeline, the classical channel's demultiplexing guarantee, the
//! registry's concurrency invariant, and the client socket's multi-client
//! recovery path.

use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tempfile::tempdir;

use qpu_mesh::backend::{Backend, Kernel};
use qpu_mesh::classical_channel::ClassicalChannel;
use qpu_mesh::client_socket::ClientSocket;
use qpu_mesh::config::{QpuConfig, RuntimeConfig};
use qpu_mesh::production_monitor::ProductionMonitor;
use qpu_mesh::qpu_server::Qpu;
use qpu_mesh::registry::{write_entry, CommsEntry, NetMode};
use qpu_mesh::task::{rebind_params, total_arity, Instruction, QuantumTask};
use qpu_mesh::Result;

struct BellStateKernel;

impl Kernel for BellStateKernel {
    fn execute(&self, _task: &QuantumTask) -> Result<Value> {
        Ok(json!({
            "results": [{"data": {"counts": {"0x0": 512, "0x3": 488}}}]
        }))
    }

    fn execute_with_channel(&self, _task: &QuantumTask, _channel: &mut ClassicalChannel) -> Result<Value> {
        self.execute(_task)
    }
}

fn bell_state_task() -> QuantumTask {
    QuantumTask {
        id: "t1".to_string(),
        config: json!({"shots": 1000, "method": "statevector", "num_clbits": 2, "avoid_parallelization": false}),
        instructions: vec![
            Instruction { name: "h".to_string(), qubits: vec![0], params: None, memory: None, clbits: None, qpus: None },
            Instruction { name: "cx".to_string(), qubits: vec![0, 1], params: None, memory: None, clbits: None, qpus: None },
            Instruction { name: "measure".to_string(), qubits: vec![0], params: None, memory: Some(vec![0]), clbits: None, qpus: None },
            Instruction { name: "measure".to_string(), qubits: vec![1], params: None, memory: Some(vec![1]), clbits: None, qpus: None },
        ],
        sending_to: vec![],
        is_dynamic: false,
        has_cc: false,
    }
}

/// Scenario 1: single-shot Bell state on a Simple backend.
#[test]
fn bell_state_counts_have_two_keys_near_500() {
    let task = bell_state_task();
    let backend = Backend::Simple(Arc::new(BellStateKernel));
    let result = backend.execute(&task, None).unwrap();

    let counts = result["results"][0]["data"]["counts"].as_object().unwrap();
    assert_eq!(counts.len(), 2);
    assert!(counts.contains_key("00"));
    assert!(counts.contains_key("11"));

    for key in ["00", "11"] {
        let count = counts[key].as_u64().unwrap() as f64;
        assert!((count - 500.0).abs() < 3.0 * 500f64.sqrt(), "count {key}={count} outside 3 sigma");
    }
}

/// Scenario 2: parameter rebinding, including a no-op empty-params update
/// and a real single-angle rebind.
#[test]
fn parameter_rebinding_noop_then_real_update() {
    let mut no_params_circuit: Vec<Instruction> = bell_state_task().instructions;
    assert_eq!(total_arity(&no_params_circuit), 0);
    rebind_params(&mut no_params_circuit, &[]).unwrap();

    let mut rx_circuit = vec![Instruction {
        name: "rx".to_string(),
        qubits: vec![0],
        params: None,
        memory: None,
        clbits: None,
        qpus: None,
    }];
    rebind_params(&mut rx_circuit, &[1.5707963]).unwrap();
    assert_eq!(rx_circuit[0].params, Some(vec![1.5707963]));
}

/// Scenario 3: CC exchange — B receives A's measurements via `recv_measure`
/// in send order, demultiplexed from a router shared with other senders.
#[test]
fn cc_measurement_exchange_preserves_send_order() {
    let mut channel_b = ClassicalChannel::bind("127.0.0.1:0", "B").unwrap();
    let b_endpoint = channel_b.bound_endpoint().to_string();

    let mut channel_a = ClassicalChannel::bind("127.0.0.1:0", "A").unwrap();
    channel_a.connect(&b_endpoint, "B").unwrap();

    channel_a.send_measure(0, "B").unwrap();
    channel_a.send_measure(1, "B").unwrap();
    channel_a.send_measure(1, "B").unwrap();

    assert_eq!(channel_b.recv_measure("A").unwrap(), 0);
    assert_eq!(channel_b.recv_measure("A").unwrap(), 1);
    assert_eq!(channel_b.recv_measure("A").unwrap(), 1);
}

/// Scenario 3, continued: `sending_to` rewrite produces exactly the
/// endpoint B's channel is bound to.
#[test]
fn cc_ingress_rewrite_produces_concrete_endpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("communications.json");
    write_entry(
        &path,
        "B",
        &CommsEntry {
            communications_endpoint: "tcp://10.1.1.1:6000".to_string(),
            executor_endpoint: None,
        },
    )
    .unwrap();

    let mut task = bell_state_task();
    task.has_cc = true;
    task.sending_to = vec!["B".to_string()];
    qpu_mesh::task::rewrite_peer_ids(&mut task, &path).unwrap();

    assert_eq!(task.sending_to, vec!["tcp://10.1.1.1:6000".to_string()]);
}

/// Scenario 4: executor fan-in — two QPUs registered under one group; the
/// executor receives one task from each and returns the same result to
/// both within one round.
#[test]
fn executor_fans_in_and_out_within_one_round() {
    let mut qpu_a = ClassicalChannel::bind("127.0.0.1:0", "qpu_a").unwrap();
    let mut qpu_b = ClassicalChannel::bind("127.0.0.1:0", "qpu_b").unwrap();
    let mut executor_channel = ClassicalChannel::bind("127.0.0.1:0", "executor").unwrap();

    let a_endpoint = qpu_a.bound_endpoint().to_string();
    let b_endpoint = qpu_b.bound_endpoint().to_string();
    executor_channel.connect_force_endpoint(&a_endpoint, "qpu_a").unwrap();
    executor_channel.connect_force_endpoint(&b_endpoint, "qpu_b").unwrap();

    let executor_endpoint = executor_channel.bound_endpoint().to_string();
    qpu_a.connect(&executor_endpoint, "executor").unwrap();
    qpu_b.connect(&executor_endpoint, "executor").unwrap();

    qpu_a.send_info("task-from-a", "executor").unwrap();
    qpu_b.send_info("task-from-b", "executor").unwrap();

    let from_a = executor_channel.recv_info("qpu_a").unwrap();
    let from_b = executor_channel.recv_info("qpu_b").unwrap();
    assert_eq!(from_a, "task-from-a");
    assert_eq!(from_b, "task-from-b");

    let joint_result = "joint-result";
    executor_channel.send_info(joint_result, "qpu_a").unwrap();
    executor_channel.send_info(joint_result, "qpu_b").unwrap();

    assert_eq!(qpu_a.recv_info("executor").unwrap(), joint_result);
    assert_eq!(qpu_b.recv_info("executor").unwrap(), joint_result);
}

/// Scenario 5: 16 concurrent registry writers, unique keys, all land.
#[test]
fn registry_concurrency_sixteen_writers_all_land() {
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

    let snapshot = qpu_mesh::registry::read_snapshot(&path).unwrap();
    assert_eq!(snapshot.len(), 16);
}

/// Scenario 6: a `ClientSocket` is one ROUTER shared across clients, not a
/// one-session-at-a-time listener — a second, unrelated client connecting
/// after the first is served correctly, with replies addressed back to the
/// right one by identity.
#[test]
fn client_socket_serves_successive_clients_by_identity() {
    let socket = ClientSocket::bind(NetMode::Hpc).unwrap();
    let endpoint = socket.bound_endpoint().to_string();

    let endpoint_first = endpoint.clone();
    let first_client = thread::spawn(move || {
        let dealer = zmq::Context::new().socket(zmq::SocketType::DEALER).unwrap();
        dealer.connect(&endpoint_first).unwrap();
        dealer.send("hello-first", 0).unwrap();
        dealer.recv_string(0).unwrap().unwrap()
    });
    assert_eq!(socket.recv_data(), "hello-first");
    socket.send_result("world-first").unwrap();
    assert_eq!(first_client.join().unwrap(), "world-first");

    let endpoint_second = endpoint.clone();
    let second_client = thread::spawn(move || {
        let dealer = zmq::Context::new().socket(zmq::SocketType::DEALER).unwrap();
        dealer.connect(&endpoint_second).unwrap();
        dealer.send("hello-second", 0).unwrap();
        dealer.recv_string(0).unwrap().unwrap()
    });
    assert_eq!(socket.recv_data(), "hello-second");
    socket.send_result("world-second").unwrap();
    assert_eq!(second_client.join().unwrap(), "world-second");
}

/// Scenario 7: `Qpu::turn_on`'s full listen → queue → compute → reply loop,
/// driven by a real client submitting one task over the wire. Guards the
/// deadlock where the listen thread's blocking receive and the compute
/// thread's reply send contended for the same lock, so a reply was never
/// sent until an unrelated later message arrived.
#[test]
fn live_qpu_answers_a_single_submitted_task() {
    let dir = tempdir().unwrap();
    let config = QpuConfig {
        runtime: RuntimeConfig {
            store_dir: dir.path().to_path_buf(),
            job_id: "e2e".to_string(),
            task_pid: "1".to_string(),
            node_name: "login".to_string(),
        },
        net_mode: NetMode::Hpc,
        name: "qpu0".to_string(),
        family: "fam".to_string(),
        backend_config: json!({}),
    };

    let client_socket = ClientSocket::bind(NetMode::Hpc).unwrap();
    let endpoint = client_socket.bound_endpoint().to_string();
    let backend = Backend::Simple(Arc::new(BellStateKernel));
    let monitor = Arc::new(ProductionMonitor::new());

    let qpu = Qpu::new(config, backend, client_socket, None, monitor);
    thread::spawn(move || {
        qpu.turn_on().unwrap();
    });

    let dealer = zmq::Context::new().socket(zmq::SocketType::DEALER).unwrap();
    dealer.connect(&endpoint).unwrap();

    let task = bell_state_task();
    dealer.send(serde_json::to_string(&task).unwrap(), 0).unwrap();

    let reply = dealer.recv_string(0).unwrap().unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    let counts = reply["results"][0]["data"]["counts"].as_object().unwrap();
    assert_eq!(counts.len(), 2);

    // No second reply should be waiting — exactly one request produced
    // exactly one response.
    assert!(dealer.poll(zmq::POLLIN, 50).unwrap() == 0);
}
