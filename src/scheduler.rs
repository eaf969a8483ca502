//! Send-rate limiting and datagram dispatch.
//!
//! Every send passes a global gap (any device) and a per-device gap widened by a
//! one-time random jitter. Attempts that arrive too early are dropped, never
//! queued; the next render tick tries again.

use crate::crypto::Key;
use crate::device::TuyaDevice;
use crate::error::Result;
use crate::protocol::MessageType;
use log::debug;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_GLOBAL_GAP: Duration = Duration::from_millis(30);
pub const DEFAULT_DEVICE_GAP: Duration = Duration::from_millis(80);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(50);

/// Process-wide throttle shared by every device.
#[derive(Debug, Clone)]
pub struct ThrottleState {
    last_send: Option<Instant>,
    min_gap: Duration,
}

impl Default for ThrottleState {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_GAP)
    }
}

impl ThrottleState {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            last_send: None,
            min_gap,
        }
    }

    pub fn admits(&self, now: Instant) -> bool {
        gap_elapsed(self.last_send, self.min_gap, now)
    }

    pub fn record(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }
}

/// Throttle for a single device.
#[derive(Debug, Clone)]
pub struct DeviceThrottle {
    last_send: Option<Instant>,
    min_gap: Duration,
    jitter: Duration,
}

impl Default for DeviceThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_GAP, Duration::ZERO)
    }
}

impl DeviceThrottle {
    pub fn new(min_gap: Duration, jitter: Duration) -> Self {
        Self {
            last_send: None,
            min_gap,
            jitter,
        }
    }

    /// Draws the jitter once, uniformly in `0..=max_jitter` milliseconds.
    pub fn with_random_jitter(min_gap: Duration, max_jitter: Duration) -> Self {
        let max_ms = max_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        Self::new(min_gap, jitter)
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Minimum spacing between two sends to this device.
    pub fn effective_gap(&self) -> Duration {
        self.min_gap + self.jitter
    }

    pub fn admits(&self, now: Instant) -> bool {
        gap_elapsed(self.last_send, self.effective_gap(), now)
    }

    pub fn record(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }
}

fn gap_elapsed(last: Option<Instant>, gap: Duration, now: Instant) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) >= gap,
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Datagram written, with its size in bytes.
    Sent(usize),
    /// Dropped by the rate limiter.
    Throttled,
}

/// A connectionless socket able to reach a broadcast address.
pub trait DatagramSocket: Send {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

/// Opens device sockets.
pub trait Transport: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn DatagramSocket>>;
}

/// Broadcast-enabled, non-blocking UDP sockets bound to an ephemeral port.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    bind_addr: SocketAddr,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }
}

struct UdpSink(UdpSocket);

impl DatagramSocket for UdpSink {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, addr)
    }
}

impl Transport for UdpTransport {
    fn open(&self) -> io::Result<Box<dyn DatagramSocket>> {
        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(self.bind_addr))?;
        socket.set_nonblocking(true)?;
        Ok(Box::new(UdpSink(socket.into())))
    }
}

/// Seals frames and writes them to the device's subnet broadcast address.
#[derive(Clone)]
pub struct TransmissionScheduler {
    transport: Arc<dyn Transport>,
    port: u16,
}

impl TransmissionScheduler {
    pub fn new(transport: Arc<dyn Transport>, port: u16) -> Self {
        Self { transport, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether a send to `device` at `now` would pass both gaps.
    pub fn admits(&self, throttle: &ThrottleState, device: &TuyaDevice, now: Instant) -> bool {
        throttle.admits(now) && device.throttle().admits(now)
    }

    /// Attempts one send. Timestamps move only when the datagram was written.
    pub fn send(
        &self,
        throttle: &mut ThrottleState,
        device: &mut TuyaDevice,
        message_type: MessageType,
        key: &Key,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<SendOutcome> {
        if !self.admits(throttle, device, now) {
            return Ok(SendOutcome::Throttled);
        }

        let packet = device.seal(message_type, key, plaintext)?;
        let bytes = packet.to_bytes()?;
        let addr = device.record().broadcast_addr(self.port)?;

        let written = device
            .socket(self.transport.as_ref())?
            .send_to(&bytes, addr)?;

        throttle.record(now);
        device.throttle_mut().record(now);
        debug!(
            "Sent {:?} to {} via {} ({} bytes)",
            message_type,
            device.id(),
            addr,
            written
        );
        Ok(SendOutcome::Sent(written))
    }
}
