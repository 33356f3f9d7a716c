//! State Cookie construction and authentication.
//!
//! The responder to an INIT keeps no state; everything it needs to build the
//! association later travels in the cookie, authenticated with a truncated
//! HMAC-SHA256 under a process-wide secret key.
//!
//! ## Layout
//! ```text
//! 0   local INIT-ACK fixed fields (16)
//! 16  peer INIT fixed fields (16)
//! 32  local port (2)  peer port (2)
//! 36  local tie-tag (4)  peer tie-tag (4)
//! 44  creation time, ms (4)  lifetime, ms (4)
//! 52  HMAC (16)
//! 68  local v4, peer v4, local v6, peer v6 address counts (2 each)
//! 76  local address TLVs, then peer address TLVs
//! ```
//! The HMAC covers every byte of the cookie, address TLVs included, with the
//! HMAC field zeroed.

use crate::core::chunk::{InitFixed, INIT_FIXED_SIZE};
use crate::core::param::{self, ParamIter};
use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the process-wide cookie secret
pub const SECRET_KEY_SIZE: usize = 4096;

/// Truncated HMAC length carried in the cookie
pub const HMAC_SIZE: usize = 16;

/// Fixed part of the cookie, before the address TLVs
pub const COOKIE_FIXED_SIZE: usize = 76;

const HMAC_OFFSET: usize = 52;

type HmacSha256 = Hmac<Sha256>;

/// Secret used to authenticate cookies. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    /// Fill the key by concatenating successive draws from `rng`.
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut key = Vec::with_capacity(SECRET_KEY_SIZE);
        while key.len() < SECRET_KEY_SIZE {
            let draw = rng.next_u32().to_be_bytes();
            let take = draw.len().min(SECRET_KEY_SIZE - key.len());
            key.extend_from_slice(&draw[..take]);
        }
        Self(key)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.0.len())
    }
}

/// Fields carried in a State Cookie
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateCookie {
    /// Fixed fields of the INIT-ACK this side sent
    pub local_init_ack: InitFixed,
    /// Fixed fields of the peer's INIT
    pub peer_init: InitFixed,
    pub local_port: u16,
    pub peer_port: u16,
    pub local_tie_tag: u32,
    pub peer_tie_tag: u32,
    /// Creation time in milliseconds, truncated to 32 bits
    pub created_at_ms: u32,
    pub lifetime_ms: u32,
    pub local_addresses: Vec<IpAddr>,
    pub peer_addresses: Vec<IpAddr>,
}

impl StateCookie {
    /// Milliseconds past expiry at `now_ms`, or `None` while still fresh.
    pub fn staleness(&self, now_ms: u32) -> Option<u32> {
        let age = now_ms.wrapping_sub(self.created_at_ms);
        (age > self.lifetime_ms).then(|| age - self.lifetime_ms)
    }

    pub fn is_stale(&self, now_ms: u32) -> bool {
        self.staleness(now_ms).is_some()
    }

    /// Size of the serialized cookie
    pub fn encoded_len(&self) -> usize {
        COOKIE_FIXED_SIZE
            + self
                .local_addresses
                .iter()
                .chain(&self.peer_addresses)
                .map(param::address_param_len)
                .sum::<usize>()
    }
}

fn family_counts(addrs: &[IpAddr]) -> Result<(u16, u16)> {
    let v4 = addrs.iter().filter(|a| a.is_ipv4()).count();
    let v6 = addrs.len() - v4;
    let too_many = || ProtocolError::InvalidCookie(constants::ERR_COOKIE_ADDRESSES.into());
    Ok((
        u16::try_from(v4).map_err(|_| too_many())?,
        u16::try_from(v6).map_err(|_| too_many())?,
    ))
}

/// Builds and validates cookies under one secret key
#[derive(Debug)]
pub struct CookieCodec {
    key: SecretKey,
}

impl CookieCodec {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    fn mac(&self, cookie_with_zeroed_hmac: &[u8]) -> Result<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_bytes())
            .map_err(|e| ProtocolError::InvariantViolation(format!("HMAC key rejected: {e}")))?;
        mac.update(cookie_with_zeroed_hmac);
        Ok(mac)
    }

    /// Serialize and sign a cookie.
    pub fn build(&self, cookie: &StateCookie) -> Result<Vec<u8>> {
        let (local_v4, local_v6) = family_counts(&cookie.local_addresses)?;
        let (peer_v4, peer_v6) = family_counts(&cookie.peer_addresses)?;

        let mut out = Vec::with_capacity(
            COOKIE_FIXED_SIZE
                + (cookie.local_addresses.len() + cookie.peer_addresses.len()) * 20,
        );
        cookie.local_init_ack.encode(&mut out);
        cookie.peer_init.encode(&mut out);
        out.put_u16(cookie.local_port);
        out.put_u16(cookie.peer_port);
        out.put_u32(cookie.local_tie_tag);
        out.put_u32(cookie.peer_tie_tag);
        out.put_u32(cookie.created_at_ms);
        out.put_u32(cookie.lifetime_ms);
        out.put_bytes(0, HMAC_SIZE);
        out.put_u16(local_v4);
        out.put_u16(peer_v4);
        out.put_u16(local_v6);
        out.put_u16(peer_v6);
        for addr in cookie.local_addresses.iter().chain(&cookie.peer_addresses) {
            param::write_address(&mut out, addr)?;
        }

        let tag = self.mac(&out)?.finalize().into_bytes();
        out[HMAC_OFFSET..HMAC_OFFSET + HMAC_SIZE].copy_from_slice(&tag[..HMAC_SIZE]);
        Ok(out)
    }

    /// Authenticate a received cookie and decode it. No field is read before
    /// the HMAC has been checked.
    pub fn validate(&self, bytes: &[u8]) -> Result<StateCookie> {
        if bytes.len() < COOKIE_FIXED_SIZE {
            return Err(ProtocolError::InvalidCookie(
                constants::ERR_COOKIE_TOO_SHORT.into(),
            ));
        }
        let mut zeroed = bytes.to_vec();
        zeroed[HMAC_OFFSET..HMAC_OFFSET + HMAC_SIZE].fill(0);
        self.mac(&zeroed)?
            .verify_truncated_left(&bytes[HMAC_OFFSET..HMAC_OFFSET + HMAC_SIZE])
            .map_err(|_| {
                debug!(len = bytes.len(), "State Cookie failed authentication");
                ProtocolError::InvalidCookie(constants::ERR_COOKIE_HMAC.into())
            })?;

        let local_init_ack = InitFixed::decode(bytes)?;
        let peer_init = InitFixed::decode(&bytes[INIT_FIXED_SIZE..])?;
        let mut buf = &bytes[2 * INIT_FIXED_SIZE..COOKIE_FIXED_SIZE];
        let local_port = buf.get_u16();
        let peer_port = buf.get_u16();
        let local_tie_tag = buf.get_u32();
        let peer_tie_tag = buf.get_u32();
        let created_at_ms = buf.get_u32();
        let lifetime_ms = buf.get_u32();
        buf.advance(HMAC_SIZE);
        let local_v4 = buf.get_u16() as usize;
        let peer_v4 = buf.get_u16() as usize;
        let local_v6 = buf.get_u16() as usize;
        let peer_v6 = buf.get_u16() as usize;

        let mut addresses = Vec::with_capacity(local_v4 + local_v6 + peer_v4 + peer_v6);
        for raw in ParamIter::new(&bytes[COOKIE_FIXED_SIZE..]) {
            let addr = param::decode_address(&raw?)?.ok_or_else(|| {
                ProtocolError::InvalidCookie(constants::ERR_COOKIE_ADDRESSES.into())
            })?;
            addresses.push(addr);
        }
        if addresses.len() != local_v4 + local_v6 + peer_v4 + peer_v6 {
            return Err(ProtocolError::InvalidCookie(
                constants::ERR_COOKIE_ADDRESSES.into(),
            ));
        }
        let peer_addresses = addresses.split_off(local_v4 + local_v6);
        let local_addresses = addresses;
        if family_counts(&local_addresses)? != (local_v4 as u16, local_v6 as u16)
            || family_counts(&peer_addresses)? != (peer_v4 as u16, peer_v6 as u16)
        {
            return Err(ProtocolError::InvalidCookie(
                constants::ERR_COOKIE_ADDRESSES.into(),
            ));
        }

        Ok(StateCookie {
            local_init_ack,
            peer_init,
            local_port,
            peer_port,
            local_tie_tag,
            peer_tie_tag,
            created_at_ms,
            lifetime_ms,
            local_addresses,
            peer_addresses,
        })
    }
}
