//! Final packet assembly: verification tag, ports, destination and checksum.

use crate::core::chunk::id;
use crate::core::packet::{encode_packet, CommonHeader};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::registry::Channel;
use crate::transport::Transport;
use std::net::SocketAddr;
use tracing::{trace, warn};

/// Where a chunk chain goes and which tag it carries
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Reply to a packet that matched no association: the tag is chosen by
    /// the caller and the packet goes back to its source.
    Reflect {
        verification_tag: u32,
        local_port: u16,
        remote_port: u16,
        destination: SocketAddr,
    },
    /// Traffic for an association
    Channel {
        channel: &'a Channel,
        /// Index into the channel's remote addresses
        explicit: Option<usize>,
        /// Initiate tag of the INIT being answered, stamped on an INIT-ACK
        peer_init_tag: Option<u32>,
    },
}

impl Route<'_> {
    fn resolve(&self, chunks: &[u8]) -> Result<(CommonHeader, SocketAddr)> {
        match *self {
            Route::Reflect {
                verification_tag,
                local_port,
                remote_port,
                destination,
            } => Ok((
                CommonHeader::new(local_port, remote_port, verification_tag),
                destination,
            )),
            Route::Channel {
                channel,
                explicit,
                peer_init_tag,
            } => {
                let tag = if chunks.first() == Some(&id::INIT_ACK) {
                    peer_init_tag.ok_or_else(|| {
                        ProtocolError::InvariantViolation(constants::ERR_MISSING_INIT_TAG.into())
                    })?
                } else {
                    channel.remote_tag
                };
                let ip = match explicit {
                    Some(index) => *channel.remote_addresses.get(index).ok_or_else(|| {
                        ProtocolError::TransportError(format!(
                            "{} ({index})",
                            constants::ERR_DEST_INDEX
                        ))
                    })?,
                    None => match channel.last_source {
                        Some(ip) => ip,
                        None => *channel
                            .remote_addresses
                            .get(channel.primary_path)
                            .ok_or_else(|| {
                                ProtocolError::TransportError(
                                    constants::ERR_NO_DESTINATION.into(),
                                )
                            })?,
                    },
                };
                Ok((
                    CommonHeader::new(channel.local_port, channel.remote_port, tag),
                    SocketAddr::new(ip, channel.remote_port),
                ))
            }
        }
    }
}

/// Stamps and sends finished chunk chains
#[derive(Debug, Clone, Copy)]
pub struct PacketSender {
    max_packet_size: usize,
}

impl PacketSender {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Send a chunk chain. `Ok(true)` only when the transport took every byte;
    /// a transport failure is logged and reported as `Ok(false)`.
    pub fn send<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        chunks: &[u8],
        route: Route<'_>,
    ) -> Result<bool> {
        let (header, destination) = route.resolve(chunks)?;
        let packet = encode_packet(&header, chunks)?;
        if packet.len() > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(packet.len()));
        }

        match transport.send_packet(&packet, destination) {
            Ok(sent) if sent == packet.len() => {
                trace!(
                    %destination,
                    tag = header.verification_tag,
                    len = packet.len(),
                    "Packet sent"
                );
                Ok(true)
            }
            Ok(sent) => {
                warn!(%destination, sent, len = packet.len(), "Short send");
                Ok(false)
            }
            Err(e) => {
                warn!(%destination, error = %e, "Transport refused packet");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::builder;
    use crate::core::checksum::validate_checksum;
    use crate::protocol::registry::{ChannelId, ChannelRegistry, InstanceRegistry, InstanceSpec, Binding};
    use crate::protocol::address::AddressTypes;
    use crate::transport::memory::MemoryTransport;

    fn registry_with_channel() -> (ChannelRegistry, ChannelId) {
        let mut instances = InstanceRegistry::new();
        let inst = instances
            .register(InstanceSpec {
                local_port: 5000,
                binding: Binding::Any(AddressTypes::IPV4),
                supported: AddressTypes::IPV4,
                inbound_streams: 1,
                outbound_streams: 1,
                events: None,
            })
            .unwrap();
        let mut channels = ChannelRegistry::new();
        let id = channels.insert(inst, 5000, 6000, 544);
        let ch = channels.get_mut(id).unwrap();
        ch.remote_tag = 0x1111;
        ch.remote_addresses = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        ch.primary_path = 1;
        (channels, id)
    }

    #[test]
    fn test_reflect_route() {
        let mut transport = MemoryTransport::new();
        let chunk = builder::shutdown_complete(true).unwrap();
        let dest: SocketAddr = "10.9.9.9:7000".parse().unwrap();
        let ok = PacketSender::new(556)
            .send(
                &mut transport,
                &chunk,
                Route::Reflect {
                    verification_tag: 77,
                    local_port: 5000,
                    remote_port: 7000,
                    destination: dest,
                },
            )
            .unwrap();
        assert!(ok);
        let sent = &transport.sent()[0];
        assert_eq!(sent.destination, dest);
        assert!(validate_checksum(&sent.bytes));
        assert_eq!(CommonHeader::decode(&sent.bytes).unwrap().verification_tag, 77);
    }

    #[test]
    fn test_channel_destination_precedence() {
        let (mut channels, id) = registry_with_channel();
        let sender = PacketSender::new(556);
        let mut transport = MemoryTransport::new();
        let chunk = builder::cookie_ack().unwrap();

        // primary path
        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: None, peer_init_tag: None };
        sender.send(&mut transport, &chunk, route).unwrap();
        // last source wins over primary
        channels.get_mut(id).unwrap().last_source = Some("10.0.0.1".parse().unwrap());
        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: None, peer_init_tag: None };
        sender.send(&mut transport, &chunk, route).unwrap();
        // explicit index wins over both
        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: Some(1), peer_init_tag: None };
        sender.send(&mut transport, &chunk, route).unwrap();

        let dests: Vec<String> = transport.sent().iter().map(|p| p.destination.to_string()).collect();
        assert_eq!(dests, vec!["10.0.0.2:6000", "10.0.0.1:6000", "10.0.0.2:6000"]);
        for p in transport.sent() {
            assert_eq!(CommonHeader::decode(&p.bytes).unwrap().verification_tag, 0x1111);
        }

        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: Some(5), peer_init_tag: None };
        assert!(sender.send(&mut transport, &chunk, route).is_err());
    }

    #[test]
    fn test_init_ack_uses_peer_init_tag() {
        let (channels, id) = registry_with_channel();
        let mut transport = MemoryTransport::new();
        let init_ack = builder::init(id::INIT_ACK, &Default::default(), &[]).unwrap();
        let sender = PacketSender::new(556);

        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: None, peer_init_tag: Some(0xABCD) };
        sender.send(&mut transport, &init_ack, route).unwrap();
        assert_eq!(CommonHeader::decode(&transport.sent()[0].bytes).unwrap().verification_tag, 0xABCD);

        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: None, peer_init_tag: None };
        assert!(matches!(
            sender.send(&mut transport, &init_ack, route),
            Err(ProtocolError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_short_write_is_failure() {
        let (channels, id) = registry_with_channel();
        let mut transport = MemoryTransport::new();
        transport.set_short_writes(true);
        let route = Route::Channel { channel: channels.get(id).unwrap(), explicit: None, peer_init_tag: None };
        let ok = PacketSender::new(556)
            .send(&mut transport, &builder::cookie_ack().unwrap(), route)
            .unwrap();
        assert!(!ok);
    }
}
