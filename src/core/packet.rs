//! Packet framing: the common header and packet-level size limits.

use crate::core::checksum;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};

/// Size of the common header in bytes
pub const COMMON_HEADER_SIZE: usize = 12;

/// Size of a chunk header in bytes
pub const CHUNK_HEADER_SIZE: usize = 4;

/// Smallest legal packet: common header plus one empty chunk
pub const MIN_PACKET_SIZE: usize = COMMON_HEADER_SIZE + CHUNK_HEADER_SIZE;

/// Default path MTU
pub const DEFAULT_MTU: usize = 576;

/// IPv4 header overhead subtracted from the MTU
pub const IP_HEADER_SIZE: usize = 20;

/// Largest packet at the default MTU
pub const MAX_PACKET_SIZE: usize = DEFAULT_MTU - IP_HEADER_SIZE;

/// Largest packet that fits an MTU.
pub const fn max_packet_size(mtu: usize) -> usize {
    mtu.saturating_sub(IP_HEADER_SIZE)
}

/// Round a length up to the next multiple of 4.
#[inline]
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Fixed 12-byte header at the start of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub verification_tag: u32,
    pub checksum: u32,
}

impl CommonHeader {
    /// Header for an outgoing packet; the checksum is filled in on send.
    pub fn new(src_port: u16, dst_port: u16, verification_tag: u32) -> Self {
        Self {
            src_port,
            dst_port,
            verification_tag,
            checksum: 0,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader(
                constants::ERR_TRUNCATED_HEADER.into(),
            ));
        }
        let mut buf = &bytes[..COMMON_HEADER_SIZE];
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let verification_tag = buf.get_u32();
        let checksum = buf.get_u32_le();
        Ok(Self {
            src_port,
            dst_port,
            verification_tag,
            checksum,
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(self.src_port);
        dst.put_u16(self.dst_port);
        dst.put_u32(self.verification_tag);
        dst.put_u32_le(self.checksum);
    }
}

/// A received packet split into its header and chunk chain
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: CommonHeader,
    pub chunks: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Split raw bytes without any semantic validation.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = CommonHeader::decode(bytes)?;
        Ok(Self {
            header,
            chunks: &bytes[COMMON_HEADER_SIZE..],
        })
    }
}

/// Assemble a packet from a header and an already padded chunk chain, with
/// the checksum set.
pub fn encode_packet(header: &CommonHeader, chunks: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(COMMON_HEADER_SIZE + chunks.len());
    CommonHeader::new(header.src_port, header.dst_port, header.verification_tag).encode(&mut out);
    out.extend_from_slice(chunks);
    checksum::set_checksum(&mut out)?;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = CommonHeader::new(0x1234, 0x5678, 0xDEAD_BEEF);
        let mut out = Vec::new();
        header.encode(&mut out);
        assert_eq!(&out[..8], &[0x12, 0x34, 0x56, 0x78, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(CommonHeader::decode(&out).unwrap(), header);
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            CommonHeader::decode(&[0u8; 11]),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_encode_packet_sets_checksum() {
        let packet = encode_packet(&CommonHeader::new(1, 2, 3), &[0x0B, 0, 0, 4]).unwrap();
        assert_eq!(packet.len(), 16);
        assert!(checksum::validate_checksum(&packet));
    }

    #[test]
    fn test_padding_and_limits() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(5), 8);
        assert_eq!(padded_len(8), 8);
        assert_eq!(MAX_PACKET_SIZE, 556);
        assert_eq!(max_packet_size(1500), 1480);
    }
}
