//! The QPU's client-facing request/reply socket.
//!
//! One per QPU process, bound at construction to either `tcp://127.0.0.1:*`
//! (`hpc` mode) or the best local IPv4 address (`co_located` mode, for
//! multi-node jobs where peers need a routable address). Built on a zmq
//! ROUTER socket, the same native request/reply primitive
//! `rigetti-qcs-sdk-rust`'s `qpu::rpcq::Client` uses on its DEALER side:
//! every inbound message is automatically tagged with the sending client's
//! ZMTP identity frame, which doubles as the routing id a reply must be
//! addressed back to. Replies are addressed in receive order, tracked here
//! as a FIFO of identity frames since the compute thread is single-threaded
//! and always answers in the order it received.
//!
//! `recv_data` and `send_result` both take `&self`, not `&mut self`: zmq
//! sockets may be used concurrently by one recv-calling thread and one
//! send-calling thread (but not two threads calling the same direction at
//! once), so the listen thread can block in `recv_data` while the compute
//! thread independently calls `send_result` for the previous request — no
//! mutex ever spans both a blocking receive and a send.

use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;

use zmq::{Context, Socket, SocketType};

use crate::registry::NetMode;
use crate::{QpuMeshError, Result};

/// Sentinel payload the listen loop treats as "this session is over" —
/// returned whenever the ROUTER socket errors or yields a malformed frame.
pub const CLOSE_SENTINEL: &str = "CLOSE";

/// The QPU's client-facing socket.
pub struct ClientSocket {
    socket: Socket,
    /// FIFO of client identity frames awaiting a reply, oldest first.
    pending: Mutex<VecDeque<Vec<u8>>>,
    bound_endpoint: String,
}

impl ClientSocket {
    /// Bind per `mode`: `Hpc` binds loopback with a kernel-assigned port;
    /// `CoLocated` binds the highest-link-speed local IPv4 address.
    pub fn bind(mode: NetMode) -> Result<Self> {
        let host = match mode {
            NetMode::Hpc => "127.0.0.1".to_string(),
            NetMode::CoLocated => best_local_ipv4()?.to_string(),
        };

        let context = Context::new();
        let socket = context
            .socket(SocketType::ROUTER)
            .map_err(|e| QpuMeshError::Transport(format!("creating client socket: {e}")))?;
        socket
            .bind(&format!("tcp://{host}:*"))
            .map_err(|e| QpuMeshError::Transport(format!("binding client socket: {e}")))?;
        let bound_endpoint = socket
            .get_last_endpoint()
            .map_err(|e| QpuMeshError::Transport(format!("reading bound endpoint: {e}")))?
            .map_err(|_| {
                QpuMeshError::Transport("bound endpoint was not valid UTF-8".to_string())
            })?;

        Ok(Self {
            socket,
            pending: Mutex::new(VecDeque::new()),
            bound_endpoint,
        })
    }

    /// The endpoint this socket is bound to, for publishing into `qpus.json`.
    pub fn bound_endpoint(&self) -> &str {
        &self.bound_endpoint
    }

    /// Block for the next client message. Pushes the sender's identity
    /// frame onto the pending-reply queue and returns its payload; returns
    /// [`CLOSE_SENTINEL`] (without enqueuing anything) on a malformed frame
    /// or socket error, since no reply is owed in that case.
    pub fn recv_data(&self) -> String {
        match self.socket.recv_multipart(0) {
            Ok(parts) if parts.len() >= 2 => {
                let identity = parts[0].clone();
                let payload = String::from_utf8_lossy(&parts[1]).into_owned();
                self.pending.lock().unwrap().push_back(identity);
                payload
            }
            _ => CLOSE_SENTINEL.to_string(),
        }
    }

    /// Reply to the oldest un-replied client identity.
    pub fn send_result(&self, payload: &str) -> Result<()> {
        let identity = self.pending.lock().unwrap().pop_front().ok_or_else(|| {
            QpuMeshError::Protocol("send_result called with no pending routing id".to_string())
        })?;
        self.socket
            .send_multipart([identity, payload.as_bytes().to_vec()], 0)
            .map_err(|e| QpuMeshError::Transport(format!("reply send failed: {e}")))
    }
}

/// One candidate interface considered by [`best_local_ipv4`].
struct Candidate {
    addr: std::net::Ipv4Addr,
    speed_mbps: u64,
}

/// Enumerate interfaces, skip loopback/down/non-IPv4, and pick the one with
/// the highest advertised link speed (Ethernet via `/sys/class/net/<if>/speed`,
/// InfiniBand via `/sys/class/infiniband/<dev>/ports/<port>/rate`). Ties are
/// broken by enumeration order.
fn best_local_ipv4() -> Result<std::net::Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| QpuMeshError::Configuration(format!("enumerating interfaces: {e}")))?;

    let mut candidates = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        let std::net::IpAddr::V4(addr) = iface.ip() else {
            continue;
        };
        if !interface_is_up(&iface.name) {
            continue;
        }
        candidates.push(Candidate {
            addr,
            speed_mbps: link_speed_mbps(&iface.name),
        });
    }

    candidates
        .into_iter()
        .max_by_key(|c| c.speed_mbps)
        .map(|c| c.addr)
        .ok_or_else(|| {
            QpuMeshError::Configuration("no usable non-loopback IPv4 interface found".to_string())
        })
}

fn interface_is_up(name: &str) -> bool {
    let operstate = fs::read_to_string(format!("/sys/class/net/{name}/operstate"));
    match operstate {
        Ok(state) => state.trim() == "up",
        // Not every platform/sandbox exposes sysfs; treat unknown as up
        // rather than excluding every interface outright.
        Err(_) => true,
    }
}

fn link_speed_mbps(name: &str) -> u64 {
    if let Ok(speed) = fs::read_to_string(format!("/sys/class/net/{name}/speed")) {
        if let Ok(mbps) = speed.trim().parse::<i64>() {
            if mbps > 0 {
                return mbps as u64;
            }
        }
    }

    if let Ok(entries) = fs::read_dir("/sys/class/infiniband") {
        for dev in entries.flatten() {
            let ports_dir = dev.path().join("ports");
            let Ok(ports) = fs::read_dir(&ports_dir) else {
                continue;
            };
            for port in ports.flatten() {
                let rate_path = port.path().join("rate");
                if let Ok(rate) = fs::read_to_string(&rate_path) {
                    // Format is like "100 Gb/sec (4X EDR)"; take the leading
                    // number and treat it as Gb/s, converted to Mb/s.
                    if let Some(gbps) = rate.split_whitespace().next().and_then(|s| s.parse::<u64>().ok()) {
                        return gbps * 1000;
                    }
                }
            }
        }
    }

    0
}
