//! Structural checks on an inbound packet, run before any chunk is looked at.

use crate::core::checksum;
use crate::core::packet::{CommonHeader, MIN_PACKET_SIZE};
use crate::protocol::address::is_valid_unicast;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Why a packet was dropped by the validator
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("bad packet length {0}")]
    Length(usize),

    #[error("checksum mismatch")]
    Checksum,

    #[error("zero port")]
    ZeroPort,

    #[error("unusable source address {0}")]
    SourceAddress(IpAddr),

    #[error("unusable destination address {0}")]
    DestinationAddress(IpAddr),
}

/// Validate a packet in order: length, checksum, ports, then both addresses.
///
/// `max_size` is the packet ceiling derived from the MTU.
pub fn validate(
    packet: &[u8],
    source: &SocketAddr,
    destination: &SocketAddr,
    max_size: usize,
) -> Result<CommonHeader, Rejection> {
    let len = packet.len();
    if len % 4 != 0 || !(MIN_PACKET_SIZE..=max_size).contains(&len) {
        return Err(Rejection::Length(len));
    }
    if !checksum::validate_checksum(packet) {
        return Err(Rejection::Checksum);
    }
    let header = CommonHeader::decode(packet).map_err(|_| Rejection::Length(len))?;
    if header.src_port == 0 || header.dst_port == 0 {
        return Err(Rejection::ZeroPort);
    }
    if !is_valid_unicast(&source.ip()) {
        return Err(Rejection::SourceAddress(source.ip()));
    }
    if !is_valid_unicast(&destination.ip()) {
        return Err(Rejection::DestinationAddress(destination.ip()));
    }
    Ok(header)
}
