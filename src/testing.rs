//! Test doubles shared by the unit tests.

use crate::scheduler::{DatagramSocket, Transport};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) type Sent = Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>;

/// Transport whose sockets record every datagram instead of sending it.
#[derive(Default, Clone)]
pub(crate) struct RecordingTransport {
    pub(crate) sent: Sent,
}

struct RecordingSocket(Sent);

impl DatagramSocket for RecordingSocket {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.lock().push((buf.to_vec(), addr));
        Ok(buf.len())
    }
}

impl Transport for RecordingTransport {
    fn open(&self) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(RecordingSocket(self.sent.clone())))
    }
}
