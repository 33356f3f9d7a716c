//! Packet checksum.
//!
//! CRC32-C (Castagnoli) computed over the whole packet with the checksum field
//! treated as zero, stored little-endian in bytes 8..12.

use crate::core::packet::COMMON_HEADER_SIZE;
use crate::error::{constants, ProtocolError, Result};

/// Offset of the checksum field inside the common header
pub const CHECKSUM_OFFSET: usize = 8;

const ZEROED_FIELD: [u8; 4] = [0; 4];

/// Compute the checksum of `packet` as if its checksum field were zero.
///
/// Packets shorter than the common header are hashed as-is.
pub fn compute(packet: &[u8]) -> u32 {
    if packet.len() < COMMON_HEADER_SIZE {
        return crc32c::crc32c(packet);
    }
    let crc = crc32c::crc32c(&packet[..CHECKSUM_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &ZEROED_FIELD);
    crc32c::crc32c_append(crc, &packet[COMMON_HEADER_SIZE..])
}

/// Compute and write the checksum into a finished packet.
pub fn set_checksum(packet: &mut [u8]) -> Result<()> {
    if packet.len() < COMMON_HEADER_SIZE {
        return Err(ProtocolError::InvalidHeader(
            constants::ERR_TRUNCATED_HEADER.into(),
        ));
    }
    let crc = compute(packet);
    packet[CHECKSUM_OFFSET..COMMON_HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Read the checksum carried in the packet.
pub fn carried(packet: &[u8]) -> Option<u32> {
    let field = packet.get(CHECKSUM_OFFSET..COMMON_HEADER_SIZE)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(field);
    Some(u32::from_le_bytes(raw))
}

/// `true` when the carried checksum equals a recomputation.
pub fn validate_checksum(packet: &[u8]) -> bool {
    carried(packet) == Some(compute(packet))
}
