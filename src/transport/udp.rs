use crate::error::Result;
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// UDP encapsulation: one packet per datagram, Geco ports equal UDP ports.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl Transport for UdpTransport {
    /// Non-blocking send; a full socket buffer surfaces as `WouldBlock`.
    fn send_packet(&mut self, bytes: &[u8], destination: SocketAddr) -> Result<usize> {
        let sent = self.socket.try_send_to(bytes, destination)?;
        trace!(%destination, bytes = sent, "Datagram sent");
        Ok(sent)
    }
}
