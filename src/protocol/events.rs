//! Upcalls into the application, made synchronously from the state machine.

use crate::protocol::registry::ChannelId;
use std::net::IpAddr;

/// Parameters of a newly established association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationUp {
    pub remote_port: u16,
    pub remote_addresses: Vec<IpAddr>,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
}

/// Why an association went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The peer sent an ABORT
    PeerAbort,
    /// This side aborted, locally requested or in reply to a peer error
    LocalAbort,
    /// The shutdown sequence completed
    ShutdownComplete,
    /// The handshake could not be completed
    HandshakeFailed,
}

/// Application callback table. All methods default to doing nothing.
pub trait AssociationEvents: Send + Sync {
    fn on_association_up(&self, _channel: ChannelId, _info: &AssociationUp) {}

    fn on_association_lost(&self, _channel: ChannelId, _reason: LossReason) {}

    /// An established association was taken over by a peer that restarted
    /// with a new tag.
    fn on_peer_restart(&self, _channel: ChannelId) {}
}
