//! Passive listener for Tuya UDP broadcasts.
//! Binds the discovery ports, decodes device announcements and forwards
//! protocol envelopes (negotiation replies) to the engine.

use crate::crypto::ecb_decrypt;
use crate::device::DiscoveryEvent;
use crate::error::{Result, TuyaError};
use crate::protocol::{self, Packet};
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// v3.4 UDP discovery encryption key
const UDP_KEY_34: &[u8] = &[
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];
/// v3.5 UDP discovery encryption key (same as 3.4)
const UDP_KEY_35: &[u8] = UDP_KEY_34;
/// v3.3 UDP discovery encryption key
const UDP_KEY_33: &[u8] = b"yG9shRKIBrIBUjc3";

const CHANNEL_CAPACITY: usize = 100;
const RECV_BUFFER_LEN: usize = 4096;

/// What the listener hands to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A device announced itself.
    Announcement(DiscoveryEvent),
    /// A local-protocol envelope, e.g. a negotiation reply.
    Datagram(Vec<u8>),
}

/// Listens on the Tuya discovery ports (default: 6666, 6667, 7000).
#[derive(Debug, Clone)]
pub struct BroadcastListener {
    bind_addr: String,
    ports: Vec<u16>,
}

impl Default for BroadcastListener {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastListener {
    pub fn new() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            ports: crate::config::DEFAULT_LISTEN_PORTS.to_vec(),
        }
    }

    /// Set local address to bind to.
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    /// Set ports to listen on.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Create and configure a UDP socket for a given port.
    fn create_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|_| TuyaError::InvalidAddress(format!("{}:{}", self.bind_addr, port)))?;

        debug!("Creating UDP socket for port {}...", port);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set reuse_address on port {}: {}", port, e);
        }
        if let Err(e) = socket.set_broadcast(true) {
            warn!("Failed to set broadcast on port {}: {}", port, e);
        }

        match socket.bind(&SockAddr::from(addr)) {
            Ok(_) => debug!("Successfully bound to {}", addr),
            Err(e) => {
                error!("Failed to bind to {}: {}", addr, e);
                return Err(e.into());
            }
        }

        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Binds every configured port and spawns one receive task per socket.
    ///
    /// Must be called from within a tokio runtime. Ports that fail to bind are
    /// skipped; it is an error only if none could be bound.
    pub fn start(&self) -> Result<ListenerHandle> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.create_socket(port) {
                Ok(s) => sockets.push(Arc::new(s)),
                Err(e) => warn!("Failed to listen on port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("No available ports for listening".into()));
        }

        let local_addrs = sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect::<Vec<_>>();
        info!("Listening for Tuya broadcasts on {:?}", local_addrs);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        for socket in sockets {
            let tx = tx.clone();
            let ct = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_LEN];
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        res = socket.recv_from(&mut buf) => {
                            match res {
                                Ok((len, addr)) => {
                                    debug!("Received UDP packet from {}: {} bytes", addr, len);
                                    let Some(event) = classify(&buf[..len]) else {
                                        continue;
                                    };
                                    if tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!("Broadcast receive failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
                debug!("Broadcast receiver stopped");
            });
        }

        Ok(ListenerHandle {
            rx,
            cancel,
            local_addrs,
        })
    }
}

/// Receiving end of a running [`BroadcastListener`]. Dropping it stops the listener.
pub struct ListenerHandle {
    rx: mpsc::Receiver<ListenerEvent>,
    cancel: CancellationToken,
    local_addrs: Vec<SocketAddr>,
}

impl ListenerHandle {
    /// Returns the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<ListenerEvent> {
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        self.rx.recv().await
    }

    /// Events as a stream, ending once the listener has stopped.
    pub fn stream(&mut self) -> impl Stream<Item = ListenerEvent> + '_ {
        let rx = &mut self.rx;
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addrs", &self.local_addrs)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Sorts a received datagram into a protocol envelope or a device announcement.
pub fn classify(data: &[u8]) -> Option<ListenerEvent> {
    if Packet::parse(data).is_ok() {
        return Some(ListenerEvent::Datagram(data.to_vec()));
    }
    parse_announcement(data).map(ListenerEvent::Announcement)
}

/// Decodes a discovery announcement in any of the formats devices broadcast.
pub fn parse_announcement(data: &[u8]) -> Option<DiscoveryEvent> {
    // 1. Raw JSON (v3.1, port 6666)
    if let Ok(val) = serde_json::from_slice::<Value>(data) {
        return event_from_json(&val);
    }

    // 2. Framed announcement (55AA or 6699)
    for key in [UDP_KEY_35, UDP_KEY_33] {
        let Ok(payload) = protocol::unpack_announcement(data, key) else {
            continue;
        };
        if payload.is_empty() {
            continue;
        }
        if let Ok(val) = serde_json::from_slice::<Value>(&payload) {
            return event_from_json(&val);
        }
        for k in [UDP_KEY_33, UDP_KEY_34] {
            if let Ok(decrypted) = ecb_decrypt(k, &payload)
                && let Ok(val) = serde_json::from_slice::<Value>(&decrypted)
            {
                debug!("Decrypted ECB announcement payload");
                return event_from_json(&val);
            }
        }
    }

    // 3. Whole packet AES-ECB (v3.3 fallback)
    for key in [UDP_KEY_33, UDP_KEY_34] {
        if let Ok(decrypted) = ecb_decrypt(key, data)
            && let Ok(val) = serde_json::from_slice::<Value>(&decrypted)
        {
            return event_from_json(&val);
        }
    }

    // 4. JSON somewhere inside the packet
    if let Some(pos) = data.iter().position(|&b| b == b'{')
        && let Ok(val) = serde_json::from_slice::<Value>(&data[pos..])
    {
        return event_from_json(&val);
    }

    debug!("Failed to parse UDP packet of {} bytes", data.len());
    None
}

fn event_from_json(val: &Value) -> Option<DiscoveryEvent> {
    let text = |name: &str| val.get(name).and_then(Value::as_str).map(str::to_string);

    let id = text("gwId").or_else(|| text("devId")).or_else(|| text("id"))?;
    let ip = text("ip")?;
    Some(DiscoveryEvent {
        gw_id: id,
        ip,
        uuid: text("uuid"),
        version: text("version"),
        product_key: text("productKey"),
        token: text("token"),
        rnd: text("rnd"),
    })
}
