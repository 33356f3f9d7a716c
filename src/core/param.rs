//! Variable-length parameters, address TLVs and error causes.
//!
//! Parameters and error causes share one layout: type (u16), length (u16,
//! header included, padding excluded), value padded to 4 bytes.

use crate::core::packet::padded_len;
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Size of a parameter or error cause header
pub const PARAM_HEADER_SIZE: usize = 4;

/// Parameter types
pub mod kind {
    pub const HEARTBEAT_INFO: u16 = 0x0001;
    pub const IPV4_ADDRESS: u16 = 0x0005;
    pub const IPV6_ADDRESS: u16 = 0x0006;
    pub const STATE_COOKIE: u16 = 0x0007;
    pub const UNRECOGNIZED_PARAMETER: u16 = 0x0008;
    pub const COOKIE_PRESERVATIVE: u16 = 0x0009;
    pub const HOST_NAME: u16 = 0x000B;
    pub const SUPPORTED_ADDRESS_TYPES: u16 = 0x000C;
    pub const ECN_CAPABLE: u16 = 0x8000;
    pub const FORWARD_TSN_SUPPORTED: u16 = 0xC000;
    pub const ADAPTATION_LAYER: u16 = 0xC006;
}

/// Error cause codes carried in ABORT and ERROR chunks
pub mod cause {
    pub const INVALID_STREAM_ID: u16 = 1;
    pub const MISSING_MANDATORY_PARAM: u16 = 2;
    pub const STALE_COOKIE: u16 = 3;
    pub const OUT_OF_RESOURCE: u16 = 4;
    pub const UNRESOLVABLE_ADDRESS: u16 = 5;
    pub const UNRECOGNIZED_CHUNK_TYPE: u16 = 6;
    pub const INVALID_MANDATORY_PARAM: u16 = 7;
    pub const UNRECOGNIZED_PARAMS: u16 = 8;
    pub const NO_USER_DATA: u16 = 9;
    pub const COOKIE_RECEIVED_DURING_SHUTDOWN: u16 = 10;
    pub const RESTART_WITH_NEW_ADDRESSES: u16 = 11;
    pub const USER_INITIATED_ABORT: u16 = 12;
    pub const PROTOCOL_VIOLATION: u16 = 13;
    pub const PEER_INSTANCE_NOT_FOUND: u16 = 14;
    pub const PEER_NOT_LISTENING_PORT: u16 = 15;
    pub const DELETE_LAST_IP_FAILED: u16 = 16;
    pub const OP_REFUSED_NO_RESOURCES: u16 = 17;
    pub const DELETE_SOURCE_ADDRESS: u16 = 18;
    pub const UNMATCHED_DEST_ADDR_FAMILY: u16 = 19;
    pub const PEER_NOT_LISTENING_ADDR: u16 = 20;
    pub const PEER_NOT_SUPPORT_ADDR_TYPES: u16 = 21;
    pub const INIT_VER_TAG_NOT_ZERO: u16 = 22;
}

/// Parameter types this stack understands inside INIT and INIT-ACK.
pub const fn is_known(param_type: u16) -> bool {
    matches!(
        param_type,
        kind::HEARTBEAT_INFO
            | kind::IPV4_ADDRESS
            | kind::IPV6_ADDRESS
            | kind::STATE_COOKIE
            | kind::UNRECOGNIZED_PARAMETER
            | kind::COOKIE_PRESERVATIVE
            | kind::HOST_NAME
            | kind::SUPPORTED_ADDRESS_TYPES
            | kind::ECN_CAPABLE
            | kind::FORWARD_TSN_SUPPORTED
            | kind::ADAPTATION_LAYER
    )
}

/// One length-checked parameter or error cause
#[derive(Debug, Clone, Copy)]
pub struct RawParam<'a> {
    pub param_type: u16,
    pub value: &'a [u8],
    /// Header plus value, padding excluded
    pub wire: &'a [u8],
}

/// Walks a TLV list. Yields one error and then stops on a length violation,
/// including a zero-length entry that would never advance.
#[derive(Debug, Clone)]
pub struct ParamIter<'a> {
    rest: &'a [u8],
}

impl<'a> ParamIter<'a> {
    pub fn new(list: &'a [u8]) -> Self {
        Self { rest: list }
    }
}

impl<'a> Iterator for ParamIter<'a> {
    type Item = Result<RawParam<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < PARAM_HEADER_SIZE {
            self.rest = &[];
            return Some(Err(ProtocolError::MalformedParameter(
                constants::ERR_PARAM_LENGTH.into(),
            )));
        }
        let mut head = self.rest;
        let param_type = head.get_u16();
        let length = head.get_u16() as usize;
        if length < PARAM_HEADER_SIZE || length > self.rest.len() {
            self.rest = &[];
            return Some(Err(ProtocolError::MalformedParameter(
                constants::ERR_PARAM_LENGTH.into(),
            )));
        }
        let wire = &self.rest[..length];
        let advance = padded_len(length).min(self.rest.len());
        self.rest = &self.rest[advance..];
        Some(Ok(RawParam {
            param_type,
            value: &wire[PARAM_HEADER_SIZE..],
            wire,
        }))
    }
}

/// First parameter of a type; malformed lists yield `None`.
pub fn find_param(list: &[u8], param_type: u16) -> Option<RawParam<'_>> {
    ParamIter::new(list)
        .map_while(|p| p.ok())
        .find(|p| p.param_type == param_type)
}

/// Append a TLV with zero padding.
pub fn write_tlv<B: BufMut>(dst: &mut B, tlv_type: u16, value: &[u8]) -> Result<()> {
    let length = PARAM_HEADER_SIZE + value.len();
    let length16 = u16::try_from(length)
        .map_err(|_| ProtocolError::MalformedParameter(constants::ERR_PARAM_LENGTH.into()))?;
    dst.put_u16(tlv_type);
    dst.put_u16(length16);
    dst.put_slice(value);
    dst.put_bytes(0, padded_len(length) - length);
    Ok(())
}

/// Encode one error cause TLV.
pub fn encode_cause(code: u16, info: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(padded_len(PARAM_HEADER_SIZE + info.len()));
    write_tlv(&mut out, code, info)?;
    Ok(out)
}

/// Append an IPv4 or IPv6 address parameter.
pub fn write_address<B: BufMut>(dst: &mut B, addr: &IpAddr) -> Result<()> {
    match addr {
        IpAddr::V4(v4) => write_tlv(dst, kind::IPV4_ADDRESS, &v4.octets()),
        IpAddr::V6(v6) => write_tlv(dst, kind::IPV6_ADDRESS, &v6.octets()),
    }
}

/// Encoded size of an address parameter
pub fn address_param_len(addr: &IpAddr) -> usize {
    match addr {
        IpAddr::V4(_) => PARAM_HEADER_SIZE + 4,
        IpAddr::V6(_) => PARAM_HEADER_SIZE + 16,
    }
}

/// Decode an address parameter. `Ok(None)` for non-address types.
pub fn decode_address(param: &RawParam<'_>) -> Result<Option<IpAddr>> {
    match param.param_type {
        kind::IPV4_ADDRESS => {
            let octets: [u8; 4] = param.value.try_into().map_err(|_| {
                ProtocolError::MalformedParameter(constants::ERR_ADDRESS_PARAM.into())
            })?;
            Ok(Some(IpAddr::V4(Ipv4Addr::from(octets))))
        }
        kind::IPV6_ADDRESS => {
            let octets: [u8; 16] = param.value.try_into().map_err(|_| {
                ProtocolError::MalformedParameter(constants::ERR_ADDRESS_PARAM.into())
            })?;
            Ok(Some(IpAddr::V6(Ipv6Addr::from(octets))))
        }
        _ => Ok(None),
    }
}

/// Read a big-endian u32 parameter value such as the cookie preservative.
pub fn read_u32_value(param: &RawParam<'_>) -> Option<u32> {
    let mut value = param.value;
    (value.len() >= 4).then(|| value.get_u32())
}
