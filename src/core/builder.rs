//! Encoders for the chunks the dispatch layer emits.
//!
//! Every builder returns a chunk already padded to a 4-byte boundary, ready
//! to be appended to a bundle.

use crate::core::chunk::{id, ChunkHeader, InitFixed, FLAG_T_BIT, INIT_FIXED_SIZE};
use crate::core::packet::{padded_len, CHUNK_HEADER_SIZE};
use crate::core::param::{self, kind};
use crate::error::{constants, ProtocolError, Result};
use bytes::BufMut;

/// Encode a chunk with an arbitrary value.
pub fn chunk(chunk_id: u8, flags: u8, value: &[u8]) -> Result<Vec<u8>> {
    let length = CHUNK_HEADER_SIZE + value.len();
    let length16 = u16::try_from(length)
        .map_err(|_| ProtocolError::MalformedChunk(constants::ERR_CHUNK_TOO_LARGE.into()))?;
    let mut out = Vec::with_capacity(padded_len(length));
    ChunkHeader {
        chunk_id,
        flags,
        length: length16,
    }
    .encode(&mut out);
    out.put_slice(value);
    out.put_bytes(0, padded_len(length) - length);
    Ok(out)
}

/// INIT or INIT-ACK with its parameter list (already TLV-encoded).
pub fn init(chunk_id: u8, fixed: &InitFixed, params: &[u8]) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(INIT_FIXED_SIZE + params.len());
    fixed.encode(&mut value);
    value.put_slice(params);
    chunk(chunk_id, 0, &value)
}

/// ABORT, optionally carrying one error cause.
pub fn abort(t_bit: bool, cause: Option<&[u8]>) -> Result<Vec<u8>> {
    let flags = if t_bit { FLAG_T_BIT } else { 0 };
    chunk(id::ABORT, flags, cause.unwrap_or_default())
}

pub fn shutdown_complete(t_bit: bool) -> Result<Vec<u8>> {
    let flags = if t_bit { FLAG_T_BIT } else { 0 };
    chunk(id::SHUTDOWN_COMPLETE, flags, &[])
}

pub fn shutdown_ack() -> Result<Vec<u8>> {
    chunk(id::SHUTDOWN_ACK, 0, &[])
}

pub fn cookie_echo(cookie: &[u8]) -> Result<Vec<u8>> {
    chunk(id::COOKIE_ECHO, 0, cookie)
}

pub fn cookie_ack() -> Result<Vec<u8>> {
    chunk(id::COOKIE_ACK, 0, &[])
}

/// ERROR chunk from already encoded causes.
pub fn error(causes: &[u8]) -> Result<Vec<u8>> {
    chunk(id::ERROR, 0, causes)
}

/// Cause info for a missing mandatory parameter: count, then the types.
pub fn missing_params_info(types: &[u16]) -> Vec<u8> {
    let mut info = Vec::with_capacity(4 + types.len() * 2);
    info.put_u32(types.len() as u32);
    for t in types {
        info.put_u16(*t);
    }
    info
}

/// SUPPORTED-ADDRESS-TYPES parameter value from an address type mask.
pub fn supported_address_types(ipv4: bool, ipv6: bool) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(4);
    if ipv4 {
        value.put_u16(kind::IPV4_ADDRESS);
    }
    if ipv6 {
        value.put_u16(kind::IPV6_ADDRESS);
    }
    let mut out = Vec::new();
    param::write_tlv(&mut out, kind::SUPPORTED_ADDRESS_TYPES, &value)?;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::chunk::{Chunk, ChunkIter};
    use crate::core::param::{cause, ParamIter};

    #[test]
    fn test_abort_with_cause() {
        let c = param::encode_cause(cause::INVALID_MANDATORY_PARAM, &[]).unwrap();
        let bytes = abort(true, Some(&c)).unwrap();
        assert_eq!(bytes, vec![id::ABORT, FLAG_T_BIT, 0, 8, 0, 7, 0, 4]);

        let raw = ChunkIter::new(&bytes).next().unwrap().unwrap();
        match Chunk::parse(raw).unwrap() {
            Chunk::Abort { t_bit, causes } => {
                assert!(t_bit);
                let first = ParamIter::new(causes).next().unwrap().unwrap();
                assert_eq!(first.param_type, cause::INVALID_MANDATORY_PARAM);
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn test_init_layout() {
        let fixed = InitFixed {
            init_tag: 0x0102_0304,
            rwnd: 8192,
            outbound_streams: 5,
            inbound_streams: 6,
            initial_tsn: 42,
        };
        let bytes = init(id::INIT, &fixed, &[]).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &[id::INIT, 0, 0, 20]);
        assert_eq!(InitFixed::decode(&bytes[4..]).unwrap(), fixed);
    }

    #[test]
    fn test_missing_params_info() {
        assert_eq!(
            missing_params_info(&[kind::STATE_COOKIE]),
            vec![0, 0, 0, 1, 0, 7]
        );
    }

    #[test]
    fn test_chunk_padded() {
        let bytes = cookie_echo(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[2..4], &[0, 9]);
    }
}
