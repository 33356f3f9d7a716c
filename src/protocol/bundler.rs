//! Outbound chunk bundling.
//!
//! A [`BundleBuffer`] collects the chunks for one association (or the shared
//! buffer used for replies to out-of-the-blue packets) and releases them as a
//! single chunk chain: SACK first, then control, then data. The buffer never
//! holds more than the packet ceiling; a chunk that would overflow it forces
//! the buffered chunks out first.
//!
//! The lock is a re-entrancy guard, not a mutex: while a handler composes a
//! multi-chunk reply the buffer is locked, and a flush requested meanwhile is
//! remembered and carried out on [`BundleBuffer::unlock`].

use crate::core::packet::padded_len;
use crate::error::{constants, ProtocolError, Result};
use tracing::trace;

/// Which region of the buffer a chunk goes into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Sack,
    Control,
    Data,
}

/// A chunk chain ready for the packet sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBundle {
    pub chunks: Vec<u8>,
    /// Index into the association's address list, if one was requested
    pub destination: Option<usize>,
}

/// Result of a flush request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Buffer is locked; the request is remembered for unlock
    Deferred,
    /// Nothing buffered
    Empty,
    Ready(OutboundBundle),
}

#[derive(Debug, Clone)]
pub struct BundleBuffer {
    sack: Vec<u8>,
    ctrl: Vec<u8>,
    data: Vec<u8>,
    locked: bool,
    send_requested: bool,
    requested_destination: Option<usize>,
    /// Max bytes of chunks per packet (packet ceiling minus common header)
    ceiling: usize,
}

impl BundleBuffer {
    pub fn new(ceiling: usize) -> Self {
        Self {
            sack: Vec::new(),
            ctrl: Vec::new(),
            data: Vec::new(),
            locked: false,
            send_requested: false,
            requested_destination: None,
            ceiling,
        }
    }

    pub fn total_size(&self) -> usize {
        self.sack.len() + self.ctrl.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_size() == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Release the lock, carrying out a flush requested while it was held.
    pub fn unlock(&mut self) -> Option<OutboundBundle> {
        self.locked = false;
        if !self.send_requested {
            return None;
        }
        match self.flush(None) {
            FlushOutcome::Ready(bundle) => Some(bundle),
            FlushOutcome::Deferred | FlushOutcome::Empty => None,
        }
    }

    /// Append a chunk (padding it to 4 bytes). If it would not fit next to
    /// what is already buffered, the buffered chunks are flushed first and
    /// returned so the caller can send them.
    pub fn bundle(
        &mut self,
        region: Region,
        chunk: &[u8],
        destination: Option<usize>,
    ) -> Result<Option<OutboundBundle>> {
        let size = padded_len(chunk.len());
        if size > self.ceiling {
            return Err(ProtocolError::OversizedPacket(size));
        }

        let mut overflow = None;
        if self.total_size() + size > self.ceiling {
            trace!(
                buffered = self.total_size(),
                incoming = size,
                "Bundle full, flushing before append"
            );
            let was_locked = self.locked;
            self.locked = false;
            if let FlushOutcome::Ready(bundle) = self.flush(None) {
                overflow = Some(bundle);
            }
            self.locked = was_locked;
        }

        let target = match region {
            Region::Sack => &mut self.sack,
            Region::Control => &mut self.ctrl,
            Region::Data => &mut self.data,
        };
        target.extend_from_slice(chunk);
        target.resize(target.len() + size - chunk.len(), 0);
        if destination.is_some() {
            self.requested_destination = destination;
        }
        Ok(overflow)
    }

    /// Concatenate all regions, SACK first, and reset the buffer.
    ///
    /// The destination is the explicit override, else one requested while
    /// bundling, else left to the packet sender.
    pub fn flush(&mut self, destination: Option<usize>) -> FlushOutcome {
        if self.locked {
            self.send_requested = true;
            if destination.is_some() {
                self.requested_destination = destination;
            }
            return FlushOutcome::Deferred;
        }

        let destination = destination.or(self.requested_destination);
        let mut chunks = Vec::with_capacity(self.total_size());
        chunks.append(&mut self.sack);
        chunks.append(&mut self.ctrl);
        chunks.append(&mut self.data);
        self.send_requested = false;
        self.requested_destination = None;

        if chunks.is_empty() {
            FlushOutcome::Empty
        } else {
            FlushOutcome::Ready(OutboundBundle {
                chunks,
                destination,
            })
        }
    }
}

impl Default for BundleBuffer {
    fn default() -> Self {
        Self::new(
            crate::core::packet::MAX_PACKET_SIZE - crate::core::packet::COMMON_HEADER_SIZE,
        )
    }
}
