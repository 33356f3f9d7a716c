//! Chunk headers, the chunk chain iterator and the parsed chunk enum.
//!
//! Untrusted bytes are never reinterpreted in place: every chunk handed to the
//! state machine went through [`ChunkIter`] (length checks) and
//! [`Chunk::parse`] (per-type fixed field checks).

use crate::core::packet::{padded_len, CHUNK_HEADER_SIZE};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};

/// Chunk identifiers
pub mod id {
    pub const DATA: u8 = 0x00;
    pub const INIT: u8 = 0x01;
    pub const INIT_ACK: u8 = 0x02;
    pub const SACK: u8 = 0x03;
    pub const HEARTBEAT: u8 = 0x04;
    pub const HEARTBEAT_ACK: u8 = 0x05;
    pub const ABORT: u8 = 0x06;
    pub const SHUTDOWN: u8 = 0x07;
    pub const SHUTDOWN_ACK: u8 = 0x08;
    pub const ERROR: u8 = 0x09;
    pub const COOKIE_ECHO: u8 = 0x0A;
    pub const COOKIE_ACK: u8 = 0x0B;
    pub const ECNE: u8 = 0x0C;
    pub const CWR: u8 = 0x0D;
    pub const SHUTDOWN_COMPLETE: u8 = 0x0E;
    pub const ASCONF_ACK: u8 = 0x80;
    pub const FORWARD_TSN: u8 = 0xC0;
    pub const ASCONF: u8 = 0xC1;
}

/// T bit of ABORT and SHUTDOWN-COMPLETE: the tag is the sender's own, reflected
pub const FLAG_T_BIT: u8 = 0x01;

/// Size of the fixed part of INIT and INIT-ACK
pub const INIT_FIXED_SIZE: usize = 16;

/// `true` for ids this stack knows, whether or not the dispatch layer acts on them.
pub const fn is_known(chunk_id: u8) -> bool {
    matches!(
        chunk_id,
        id::DATA..=id::SHUTDOWN_COMPLETE | id::ASCONF_ACK | id::FORWARD_TSN | id::ASCONF
    )
}

/// What to do with an unrecognized chunk or parameter, from the top two bits
/// of its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecognizedAction {
    /// 00: stop processing, drop the rest
    Stop,
    /// 01: stop processing and report
    StopAndReport,
    /// 10: skip this one, continue
    Skip,
    /// 11: skip this one, continue, and report
    SkipAndReport,
}

impl UnrecognizedAction {
    const fn from_top_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Stop,
            0b01 => Self::StopAndReport,
            0b10 => Self::Skip,
            _ => Self::SkipAndReport,
        }
    }

    pub const fn for_chunk(chunk_id: u8) -> Self {
        Self::from_top_bits(chunk_id >> 6)
    }

    pub const fn for_param(param_type: u16) -> Self {
        Self::from_top_bits((param_type >> 14) as u8)
    }

    pub const fn stops(self) -> bool {
        matches!(self, Self::Stop | Self::StopAndReport)
    }

    pub const fn reports(self) -> bool {
        matches!(self, Self::StopAndReport | Self::SkipAndReport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_id: u8,
    pub flags: u8,
    /// Includes the header, excludes padding
    pub length: u16,
}

impl ChunkHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(ProtocolError::MalformedChunk(
                constants::ERR_TRUNCATED_CHUNK.into(),
            ));
        }
        let mut buf = &bytes[..CHUNK_HEADER_SIZE];
        Ok(Self {
            chunk_id: buf.get_u8(),
            flags: buf.get_u8(),
            length: buf.get_u16(),
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.chunk_id);
        dst.put_u8(self.flags);
        dst.put_u16(self.length);
    }

    pub fn t_bit(&self) -> bool {
        self.flags & FLAG_T_BIT != 0
    }
}

/// One length-checked chunk borrowed from a packet
#[derive(Debug, Clone, Copy)]
pub struct RawChunk<'a> {
    pub header: ChunkHeader,
    /// Value bytes after the header, padding excluded
    pub value: &'a [u8],
    /// Header plus value, padding excluded
    pub wire: &'a [u8],
}

impl RawChunk<'_> {
    pub fn chunk_id(&self) -> u8 {
        self.header.chunk_id
    }
}

/// Walks a chunk chain. Yields one error and then stops on the first
/// structural violation.
#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    rest: &'a [u8],
}

impl<'a> ChunkIter<'a> {
    pub fn new(chain: &'a [u8]) -> Self {
        Self { rest: chain }
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<RawChunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let header = match ChunkHeader::decode(self.rest) {
            Ok(header) => header,
            Err(e) => {
                self.rest = &[];
                return Some(Err(e));
            }
        };
        let length = header.length as usize;
        if length < CHUNK_HEADER_SIZE || length > self.rest.len() {
            self.rest = &[];
            return Some(Err(ProtocolError::MalformedChunk(
                constants::ERR_CHUNK_LENGTH.into(),
            )));
        }
        let wire = &self.rest[..length];
        let advance = padded_len(length).min(self.rest.len());
        self.rest = &self.rest[advance..];
        Some(Ok(RawChunk {
            header,
            value: &wire[CHUNK_HEADER_SIZE..],
            wire,
        }))
    }
}

/// Fixed fields of INIT and INIT-ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitFixed {
    pub init_tag: u32,
    pub rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
}

impl InitFixed {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INIT_FIXED_SIZE {
            return Err(ProtocolError::MalformedChunk(
                constants::ERR_INIT_TOO_SHORT.into(),
            ));
        }
        let mut buf = &bytes[..INIT_FIXED_SIZE];
        Ok(Self {
            init_tag: buf.get_u32(),
            rwnd: buf.get_u32(),
            outbound_streams: buf.get_u16(),
            inbound_streams: buf.get_u16(),
            initial_tsn: buf.get_u32(),
        })
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.init_tag);
        dst.put_u32(self.rwnd);
        dst.put_u16(self.outbound_streams);
        dst.put_u16(self.inbound_streams);
        dst.put_u32(self.initial_tsn);
    }

    /// Zero streams in either direction or a zero tag are illegal.
    pub fn has_invalid_mandatory_fields(&self) -> bool {
        self.init_tag == 0 || self.outbound_streams == 0 || self.inbound_streams == 0
    }
}

/// INIT or INIT-ACK body
#[derive(Debug, Clone, Copy)]
pub struct InitChunk<'a> {
    pub fixed: InitFixed,
    /// Variable-length parameters following the fixed fields
    pub params: &'a [u8],
}

impl<'a> InitChunk<'a> {
    pub fn parse(value: &'a [u8]) -> Result<Self> {
        let fixed = InitFixed::decode(value)?;
        Ok(Self {
            fixed,
            params: &value[INIT_FIXED_SIZE..],
        })
    }
}

/// A chunk parsed into the shape the dispatch layer needs
#[derive(Debug, Clone, Copy)]
pub enum Chunk<'a> {
    Data(RawChunk<'a>),
    Init(InitChunk<'a>),
    InitAck(InitChunk<'a>),
    Sack(RawChunk<'a>),
    Abort { t_bit: bool, causes: &'a [u8] },
    ShutdownAck,
    Error { causes: &'a [u8] },
    CookieEcho { cookie: &'a [u8] },
    CookieAck,
    ShutdownComplete { t_bit: bool },
    /// Known to the stack but handled outside this layer
    Passthrough(RawChunk<'a>),
    Unrecognized(RawChunk<'a>),
}

impl<'a> Chunk<'a> {
    pub fn parse(raw: RawChunk<'a>) -> Result<Self> {
        let chunk = match raw.chunk_id() {
            id::DATA => Self::Data(raw),
            id::INIT => Self::Init(InitChunk::parse(raw.value)?),
            id::INIT_ACK => Self::InitAck(InitChunk::parse(raw.value)?),
            id::SACK => Self::Sack(raw),
            id::ABORT => Self::Abort {
                t_bit: raw.header.t_bit(),
                causes: raw.value,
            },
            id::SHUTDOWN_ACK => Self::ShutdownAck,
            id::ERROR => Self::Error { causes: raw.value },
            id::COOKIE_ECHO => Self::CookieEcho { cookie: raw.value },
            id::COOKIE_ACK => Self::CookieAck,
            id::SHUTDOWN_COMPLETE => Self::ShutdownComplete {
                t_bit: raw.header.t_bit(),
            },
            other if is_known(other) => Self::Passthrough(raw),
            _ => Self::Unrecognized(raw),
        };
        Ok(chunk)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_respects_padding() {
        // 5-byte chunk padded to 8, then an empty COOKIE-ACK
        let chain = [9, 0, 0, 5, 0xAA, 0, 0, 0, 0x0B, 0, 0, 4];
        let chunks: Vec<_> = ChunkIter::new(&chain).collect::<Result<_>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].value, &[0xAA]);
        assert_eq!(chunks[1].chunk_id(), id::COOKIE_ACK);
    }

    #[test]
    fn test_iter_stops_after_violation() {
        let chain = [0x0B, 0, 0, 2, 0x0B, 0, 0, 4];
        let mut iter = ChunkIter::new(&chain);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());

        let overlong = [0x0B, 0, 0, 40];
        assert!(ChunkIter::new(&overlong).next().unwrap().is_err());
    }

    #[test]
    fn test_unrecognized_action_bits() {
        assert_eq!(UnrecognizedAction::for_chunk(0x3F), UnrecognizedAction::Stop);
        assert_eq!(
            UnrecognizedAction::for_chunk(0x40),
            UnrecognizedAction::StopAndReport
        );
        assert_eq!(UnrecognizedAction::for_chunk(0x8F), UnrecognizedAction::Skip);
        assert_eq!(
            UnrecognizedAction::for_param(0xC123),
            UnrecognizedAction::SkipAndReport
        );
        assert!(UnrecognizedAction::StopAndReport.stops());
        assert!(UnrecognizedAction::SkipAndReport.reports());
    }

    #[test]
    fn test_parse_init_requires_fixed_fields() {
        let chain = [id::INIT, 0, 0, 8, 1, 2, 3, 4];
        let raw = ChunkIter::new(&chain).next().unwrap().unwrap();
        assert!(matches!(
            Chunk::parse(raw),
            Err(ProtocolError::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_parse_t_bit() {
        let chain = [id::SHUTDOWN_COMPLETE, FLAG_T_BIT, 0, 4];
        let raw = ChunkIter::new(&chain).next().unwrap().unwrap();
        assert!(matches!(
            Chunk::parse(raw).unwrap(),
            Chunk::ShutdownComplete { t_bit: true }
        ));
    }

    #[test]
    fn test_known_ids() {
        assert!(is_known(id::HEARTBEAT));
        assert!(is_known(id::ASCONF));
        assert!(!is_known(0x0F));
        assert!(!is_known(0x81));
    }
}
