use crate::error::Result;
use crate::transport::Transport;
use std::net::SocketAddr;

/// A packet captured by [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
}

/// Transport that keeps every packet in memory instead of sending it.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Vec<SentPacket>,
    short_writes: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report one byte less than asked for, simulating a partial send.
    pub fn set_short_writes(&mut self, enabled: bool) {
        self.short_writes = enabled;
    }

    pub fn sent(&self) -> &[SentPacket] {
        &self.sent
    }

    /// Drain everything captured so far.
    pub fn take_sent(&mut self) -> Vec<SentPacket> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for MemoryTransport {
    fn send_packet(&mut self, bytes: &[u8], destination: SocketAddr) -> Result<usize> {
        self.sent.push(SentPacket {
            bytes: bytes.to_vec(),
            destination,
        });
        if self.short_writes {
            Ok(bytes.len().saturating_sub(1))
        } else {
            Ok(bytes.len())
        }
    }
}
