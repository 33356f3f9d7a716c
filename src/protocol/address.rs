//! Address families, address-class checks and the peer address list carried
//! in INIT and INIT-ACK.

use crate::core::param::{self, kind, ParamIter};
use crate::error::Result;
use bytes::Buf;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::{BitAnd, BitOr};
use tracing::trace;

/// Upper bound on addresses accepted from one peer
pub const MAX_NUM_ADDRESSES: usize = 32;

/// Bit mask of address families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct AddressTypes(u8);

impl AddressTypes {
    pub const NONE: Self = Self(0);
    pub const IPV4: Self = Self(1);
    pub const IPV6: Self = Self(2);
    pub const DNS: Self = Self(4);
    /// Both IP families
    pub const IP: Self = Self(1 | 2);
    pub const ALL: Self = Self(1 | 2 | 4);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Family of a concrete address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::IPV4,
            IpAddr::V6(_) => Self::IPV6,
        }
    }

    pub fn supports(self, addr: &IpAddr) -> bool {
        self.contains(Self::of(addr))
    }
}

impl BitOr for AddressTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for AddressTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for AddressTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::IPV4) {
            names.push("ipv4");
        }
        if self.contains(Self::IPV6) {
            names.push("ipv6");
        }
        if self.contains(Self::DNS) {
            names.push("dns");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

fn is_valid_v4(addr: &Ipv4Addr) -> bool {
    // 240.0.0.0/4 covers both the reserved class and broadcast
    !(addr.is_unspecified() || addr.is_multicast() || addr.octets()[0] >= 240)
}

fn is_valid_v6(addr: &Ipv6Addr) -> bool {
    if addr.is_unspecified() || addr.is_multicast() {
        return false;
    }
    let segments = addr.segments();
    let high_zero = segments[..6].iter().all(|s| *s == 0);
    // IPv4-compatible: ::a.b.c.d, with :: and ::1 excluded
    let v4_compatible = high_zero && !addr.is_loopback();
    let v4_mapped = segments[..5].iter().all(|s| *s == 0) && segments[5] == 0xFFFF;
    !(v4_compatible || v4_mapped)
}

/// Reject addresses that can never be a unicast endpoint.
pub fn is_valid_unicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_valid_v4(v4),
        IpAddr::V6(v6) => is_valid_v6(v6),
    }
}

/// Collapse IPv4-mapped IPv6 addresses (dual-stack sockets) to IPv4.
pub fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Addresses and capabilities read from a peer's INIT or INIT-ACK
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerAddresses {
    pub addresses: Vec<IpAddr>,
    /// Families the peer accepts: what it advertised, plus the family it
    /// sent from
    pub supported: AddressTypes,
    /// The SUPPORTED_ADDRESS_TYPES parameter exactly as sent, if present
    pub advertised: Option<AddressTypes>,
    /// The peer sent a host name to be resolved later
    pub host_name: bool,
}

fn supported_types_value(mut value: &[u8]) -> AddressTypes {
    let mut types = AddressTypes::NONE;
    while value.len() >= 2 {
        types = types
            | match value.get_u16() {
                kind::IPV4_ADDRESS => AddressTypes::IPV4,
                kind::IPV6_ADDRESS => AddressTypes::IPV6,
                kind::HOST_NAME => AddressTypes::DNS,
                _ => AddressTypes::NONE,
            };
    }
    types
}

/// Read the address parameters of an INIT or INIT-ACK.
///
/// Only families in `local_types` are collected. Bad-class and duplicate
/// addresses are skipped, loopback addresses are kept only when the packet
/// itself came from loopback, and the list is capped at
/// [`MAX_NUM_ADDRESSES`]. The packet source is always part of the result when
/// its family is supported.
pub fn read_peer_addresses(
    params: &[u8],
    source: IpAddr,
    local_types: AddressTypes,
) -> Result<PeerAddresses> {
    let mut peer = PeerAddresses::default();
    let allow_loopback = source.is_loopback();

    for raw in ParamIter::new(params) {
        let raw = raw?;
        match raw.param_type {
            kind::IPV4_ADDRESS | kind::IPV6_ADDRESS => {
                let Some(addr) = param::decode_address(&raw)? else {
                    continue;
                };
                if !local_types.supports(&addr) {
                    continue;
                }
                if !is_valid_unicast(&addr) || (addr.is_loopback() && !allow_loopback) {
                    trace!(%addr, "Skipping unusable peer address");
                    continue;
                }
                if peer.addresses.len() < MAX_NUM_ADDRESSES && !peer.addresses.contains(&addr) {
                    peer.addresses.push(addr);
                }
            }
            kind::SUPPORTED_ADDRESS_TYPES => {
                peer.advertised = Some(supported_types_value(raw.value));
            }
            kind::HOST_NAME => peer.host_name = true,
            _ => {}
        }
    }

    // Without the parameter a peer accepts every family
    peer.supported = peer.advertised.unwrap_or(AddressTypes::ALL) | AddressTypes::of(&source);

    if local_types.supports(&source)
        && !peer.addresses.contains(&source)
        && peer.addresses.len() < MAX_NUM_ADDRESSES
    {
        peer.addresses.push(source);
    }
    Ok(peer)
}
