//! Peer-to-peer classical channel: the router/dealer mesh QPUs use to
//! exchange mid-circuit measurements, publish their endpoint for executor
//! discovery, and (for the QC backend) transport whole circuits to an
//! executor process.
//!
//! Built directly on `zmq` ROUTER/DEALER sockets — the same pattern
//! `rigetti-qcs-sdk-rust`'s `qpu::rpcq::Client` uses for its DEALER side —
//! rather than hand-rolling a wire format: a bound ROUTER socket receives
//! from every peer that connects to it, tagging each inbound message with
//! the sender's ZMTP identity; outbound DEALER sockets, one per peer, stamp
//! that same identity on what they send because it was set on the socket
//! before `connect`. A dedicated reader thread drains the ROUTER socket via
//! `recv_multipart` into an `mpsc` channel, which the owning thread (a
//! QPU's compute thread, or the executor's main thread) demultiplexes by
//! origin. That reader thread is the only thing that ever touches the
//! ROUTER socket; sends go out over the per-peer DEALER sockets, which are
//! touched only by the single owning thread — no socket is ever shared
//! across threads for both sending and receiving.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use zmq::{Context, Socket, SocketType};

use crate::logging::{log_debug, log_event, LogCategory};
use crate::registry::CommsEntry;
use crate::{QpuMeshError, Result};

type Frame = (String, String);

/// An outbound connection to one peer: a DEALER socket whose ZMTP identity
/// was set (to this channel's id, or to its bound endpoint for
/// `force_endpoint` connections) before `connect`, so the peer's ROUTER
/// sees every frame tagged with that identity.
struct Dealer {
    socket: Socket,
}

/// The peer-to-peer classical channel owned by one QPU or executor process.
pub struct ClassicalChannel {
    id: String,
    bound_endpoint: String,
    context: Context,
    dealers: HashMap<String, Dealer>,
    buffer: HashMap<String, VecDeque<String>>,
    inbox: Receiver<Frame>,
    inbox_tx: Sender<Frame>,
}

impl ClassicalChannel {
    /// Bind the ROUTER-side server socket and start draining it in the
    /// background. `id` becomes this channel's identity; if empty, the
    /// bound endpoint string is used instead once known. `bind_addr` is a
    /// plain `host:port` pair (`"0"` for a kernel-assigned port, rendered
    /// as zmq's own `*` wildcard-port syntax).
    pub fn bind(bind_addr: &str, id: &str) -> Result<Self> {
        let context = Context::new();
        let router = context
            .socket(SocketType::ROUTER)
            .map_err(|e| QpuMeshError::Transport(format!("creating router socket: {e}")))?;
        router
            .bind(&to_zmq_endpoint(bind_addr))
            .map_err(|e| QpuMeshError::Transport(format!("binding channel socket: {e}")))?;
        let bound_endpoint = last_endpoint(&router)?;

        let router = Arc::new(router);
        let (tx, rx) = mpsc::channel();
        let reader_router = Arc::clone(&router);
        let reader_tx = tx.clone();
        thread::spawn(move || reader_loop(reader_router, reader_tx));

        let identity = if id.is_empty() {
            bound_endpoint.clone()
        } else {
            id.to_string()
        };

        log_event(
            LogCategory::Network,
            &format!("classical channel bound at {bound_endpoint} (id={identity})"),
        );

        Ok(Self {
            id: identity,
            bound_endpoint,
            context,
            dealers: HashMap::new(),
            buffer: HashMap::new(),
            inbox: rx,
            inbox_tx: tx,
        })
    }

    /// This channel's bound endpoint, `tcp://host:port`.
    pub fn bound_endpoint(&self) -> &str {
        &self.bound_endpoint
    }

    /// This channel's identity (explicit `id`, or its bound endpoint).
    pub fn identity(&self) -> &str {
        &self.id
    }

    /// Publish this channel's bound endpoint into the communications
    /// registry, under this process's registry key.
    pub fn publish(&self, comms_path: &Path, registry_key: &str) -> Result<()> {
        crate::registry::write_entry(
            comms_path,
            registry_key,
            &CommsEntry {
                communications_endpoint: self.bound_endpoint.clone(),
                executor_endpoint: None,
            },
        )
    }

    /// Idempotently connect to `endpoint`, keyed by `id` (or by `endpoint`
    /// itself if `id` is empty). The outbound identity stamped on every
    /// frame is this channel's own id.
    pub fn connect(&mut self, endpoint: &str, id: &str) -> Result<()> {
        let outbound_identity = self.id.clone();
        self.connect_as(endpoint, id, outbound_identity)
    }

    /// Same as [`Self::connect`], but stamps outbound frames with this
    /// channel's bound endpoint rather than its id — used by executors so
    /// peers recognise them by address.
    pub fn connect_force_endpoint(&mut self, endpoint: &str, id: &str) -> Result<()> {
        let forced = self.bound_endpoint.clone();
        self.connect_as(endpoint, id, forced)
    }

    fn connect_as(&mut self, endpoint: &str, id: &str, outbound_identity: String) -> Result<()> {
        let key = if id.is_empty() { endpoint } else { id };
        if self.dealers.contains_key(key) {
            return Ok(());
        }

        let socket = self
            .context
            .socket(SocketType::DEALER)
            .map_err(|e| QpuMeshError::Transport(format!("creating dealer socket: {e}")))?;
        socket
            .set_identity(outbound_identity.as_bytes())
            .map_err(|e| QpuMeshError::Transport(format!("setting dealer identity: {e}")))?;
        socket
            .connect(endpoint)
            .map_err(|e| QpuMeshError::Transport(format!("connecting to {endpoint}: {e}")))?;

        self.dealers.insert(key.to_string(), Dealer { socket });
        log_debug(
            LogCategory::Network,
            &format!("connected dealer {key} -> {endpoint}"),
        );
        Ok(())
    }

    /// Send `data` to the dealer keyed `target`. A send to an unconnected
    /// target is a hard error — the caller is expected to have connected
    /// first.
    pub fn send_info(&mut self, data: &str, target: &str) -> Result<()> {
        let dealer = self
            .dealers
            .get(target)
            .ok_or_else(|| QpuMeshError::Protocol(format!("send to unknown peer {target}")))?;
        dealer
            .socket
            .send(data, 0)
            .map_err(|e| QpuMeshError::Transport(format!("sending to {target}: {e}")))
    }

    /// Send the decimal encoding of `value` to `target`.
    pub fn send_measure(&mut self, value: i64, target: &str) -> Result<()> {
        self.send_info(&value.to_string(), target)
    }

    /// Return the next frame whose sender identity equals `origin`,
    /// draining out-of-order arrivals into the per-origin buffer. This is
    /// the demultiplexing algorithm: a shared ROUTER becomes N logical
    /// point-to-point streams while preserving each sender's order.
    pub fn recv_info(&mut self, origin: &str) -> Result<String> {
        if let Some(queue) = self.buffer.get_mut(origin) {
            if let Some(payload) = queue.pop_front() {
                return Ok(payload);
            }
        }

        loop {
            let (identity, payload) = self
                .inbox
                .recv()
                .map_err(|_| QpuMeshError::Transport("channel inbox closed".to_string()))?;

            if identity == origin {
                return Ok(payload);
            }

            self.buffer
                .entry(identity)
                .or_insert_with(VecDeque::new)
                .push_back(payload);
        }
    }

    /// Parse the next frame from `origin` as a decimal integer.
    pub fn recv_measure(&mut self, origin: &str) -> Result<i64> {
        let payload = self.recv_info(origin)?;
        payload
            .trim()
            .parse::<i64>()
            .map_err(|e| QpuMeshError::Protocol(format!("malformed measurement from {origin}: {e}")))
    }

    /// Clone of this channel's internal frame sender, used by tests to
    /// inject frames as if they arrived over the wire.
    #[cfg(test)]
    fn test_inject(&self, identity: &str, payload: &str) {
        self.inbox_tx
            .send((identity.to_string(), payload.to_string()))
            .unwrap();
    }
}

/// Render a plain `host:port` pair (with `"0"` meaning "kernel-assigned")
/// as a zmq `tcp://` endpoint, using zmq's own `*` wildcard-port syntax
/// rather than the `:0` convention of `std::net`.
fn to_zmq_endpoint(bind_addr: &str) -> String {
    let bind_addr = bind_addr.trim_start_matches("tcp://");
    let rendered = match bind_addr.strip_suffix(":0") {
        Some(host) => format!("{host}:*"),
        None => bind_addr.to_string(),
    };
    format!("tcp://{rendered}")
}

/// Read back the concrete endpoint zmq bound to after a wildcard bind.
fn last_endpoint(socket: &Socket) -> Result<String> {
    socket
        .get_last_endpoint()
        .map_err(|e| QpuMeshError::Transport(format!("reading bound endpoint: {e}")))?
        .map_err(|_| QpuMeshError::Transport("bound endpoint was not valid UTF-8".to_string()))
}

/// Drain the ROUTER socket's inbound messages into `tx` forever. Each zmq
/// message off a ROUTER is `[identity, payload]` — the identity frame is
/// prepended by zmq itself, never sent by the peer. This thread is the
/// sole reader of the ROUTER socket; it runs concurrently with whatever
/// thread owns this `ClassicalChannel` and sends over the per-peer DEALER
/// sockets, which are distinct socket objects untouched here.
fn reader_loop(router: Arc<Socket>, tx: Sender<Frame>) {
    loop {
        match router.recv_multipart(0) {
            Ok(parts) if parts.len() >= 2 => {
                let identity = String::from_utf8_lossy(&parts[0]).into_owned();
                let payload = String::from_utf8_lossy(&parts[1]).into_owned();
                if tx.send((identity, payload)).is_err() {
                    return;
                }
            }
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reports_tcp_endpoint() {
        let channel = ClassicalChannel::bind("127.0.0.1:0", "chan-a").unwrap();
        assert!(channel.bound_endpoint().starts_with("tcp://127.0.0.1:"));
        assert_eq!(channel.identity(), "chan-a");
    }

    #[test]
    fn identity_defaults_to_bound_endpoint() {
        let channel = ClassicalChannel::bind("127.0.0.1:0", "").unwrap();
        assert_eq!(channel.identity(), channel.bound_endpoint());
    }

    #[test]
    fn connect_is_idempotent() {
        let server = ClassicalChannel::bind("127.0.0.1:0", "server").unwrap();
        let addr = server.bound_endpoint().to_string();

        let mut channel = ClassicalChannel::bind("127.0.0.1:0", "chan-a").unwrap();
        channel.connect(&addr, "peer").unwrap();
        let count_before = channel.dealers.len();
        channel.connect(&addr, "peer").unwrap();
        assert_eq!(channel.dealers.len(), count_before);
    }

    #[test]
    fn send_to_unknown_target_is_protocol_error() {
        let mut channel = ClassicalChannel::bind("127.0.0.1:0", "chan-a").unwrap();
        let err = channel.send_info("hello", "ghost").unwrap_err();
        assert!(matches!(err, QpuMeshError::Protocol(_)));
    }

    #[test]
    fn recv_info_demultiplexes_by_origin() {
        let mut channel = ClassicalChannel::bind("127.0.0.1:0", "chan-a").unwrap();
        channel.test_inject("peer-b", "from-b-1");
        channel.test_inject("peer-a", "from-a-1");
        channel.test_inject("peer-b", "from-b-2");

        assert_eq!(channel.recv_info("peer-a").unwrap(), "from-a-1");
        assert_eq!(channel.recv_info("peer-b").unwrap(), "from-b-1");
        assert_eq!(channel.recv_info("peer-b").unwrap(), "from-b-2");
    }

    #[test]
    fn real_dealer_router_round_trip_over_tcp() {
        let mut router_channel = ClassicalChannel::bind("127.0.0.1:0", "B").unwrap();
        let router_addr = router_channel.bound_endpoint().to_string();

        let mut dealer_channel = ClassicalChannel::bind("127.0.0.1:0", "A").unwrap();
        dealer_channel.connect(&router_addr, "B").unwrap();

        dealer_channel.send_measure(7, "B").unwrap();
        assert_eq!(router_channel.recv_measure("A").unwrap(), 7);
    }
}
