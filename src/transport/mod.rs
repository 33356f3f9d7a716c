//! # Transport Layer
//!
//! Byte transfer below the dispatch layer.
//!
//! The dispatcher only ever calls [`Transport::send_packet`], synchronously,
//! from its single dispatch thread. Receiving is the job of the driver that
//! owns the dispatcher (see [`crate::service::endpoint`]), which feeds every
//! datagram into `Dispatcher::on_packet`.
//!
//! ## Implementations
//! - **UDP**: tokio `UdpSocket`, one Geco packet per datagram
//! - **Memory**: records sent packets, for tests and benchmarks

use crate::error::Result;
use std::net::SocketAddr;

pub mod memory;
pub mod udp;

/// Outbound half of the transport collaborator
pub trait Transport {
    /// Send one finished packet. Returns the number of bytes handed to the
    /// network; anything short of `bytes.len()` counts as a failed send.
    fn send_packet(&mut self, bytes: &[u8], destination: SocketAddr) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_packet(&mut self, bytes: &[u8], destination: SocketAddr) -> Result<usize> {
        (**self).send_packet(bytes, destination)
    }
}
