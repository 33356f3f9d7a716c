//! Instance and Channel tables.
//!
//! Both live in generational arenas. A Channel refers to its Instance by
//! [`InstanceId`], never by ownership, and a stale id simply fails to resolve.
//! Channels are soft-deleted: a deleted slot stays allocated (and invisible to
//! lookups) until [`ChannelRegistry::sweep`] runs between dispatch iterations.

use crate::core::chunk::InitFixed;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::address::AddressTypes;
use crate::protocol::bundler::BundleBuffer;
use crate::protocol::events::AssociationEvents;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with generation-checked ids
#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert_with(&mut self, make: impl FnOnce(SlotId) -> T) -> SlotId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                SlotId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                SlotId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.slots[id.index as usize].value = Some(make(id));
        self.len += 1;
        id
    }

    fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Handle to a registered Instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(SlotId);

/// Handle to a Channel (association)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(SlotId);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst#{}.{}", self.0.index, self.0.generation)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}.{}", self.0.index, self.0.generation)
    }
}

/// Local addresses an Instance listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Any local address of the given families
    Any(AddressTypes),
    /// An explicit address list
    Addresses(Vec<IpAddr>),
}

impl Binding {
    fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any(_))
    }

    fn accepts(&self, local: &IpAddr, address_type: AddressTypes) -> bool {
        match self {
            Self::Any(types) => types.contains(address_type),
            Self::Addresses(list) => list.contains(local),
        }
    }
}

/// Everything needed to register a listening endpoint
#[derive(Clone)]
pub struct InstanceSpec {
    pub local_port: u16,
    pub binding: Binding,
    pub supported: AddressTypes,
    pub inbound_streams: u16,
    pub outbound_streams: u16,
    pub events: Option<Arc<dyn AssociationEvents>>,
}

impl fmt::Debug for InstanceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceSpec")
            .field("local_port", &self.local_port)
            .field("binding", &self.binding)
            .field("supported", &self.supported)
            .field("inbound_streams", &self.inbound_streams)
            .field("outbound_streams", &self.outbound_streams)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// A listening endpoint
pub struct Instance {
    pub id: InstanceId,
    pub local_port: u16,
    pub binding: Binding,
    pub supported: AddressTypes,
    pub inbound_streams: u16,
    pub outbound_streams: u16,
    pub events: Option<Arc<dyn AssociationEvents>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("local_port", &self.local_port)
            .field("binding", &self.binding)
            .field("supported", &self.supported)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Two bindings collide when ports match and either is a wildcard or any
    /// address pair is equal.
    pub fn conflicts_with(&self, local_port: u16, binding: &Binding) -> bool {
        if self.local_port != local_port {
            return false;
        }
        match (&self.binding, binding) {
            (Binding::Addresses(ours), Binding::Addresses(theirs)) => {
                ours.iter().any(|a| theirs.contains(a))
            }
            _ => self.binding.is_wildcard() || binding.is_wildcard(),
        }
    }

    /// Addresses to advertise. A wildcard binding has no fixed list, so the
    /// address the packet arrived on stands in.
    pub fn local_addresses(&self, arrived_on: IpAddr) -> Vec<IpAddr> {
        match &self.binding {
            Binding::Any(_) => vec![arrived_on],
            Binding::Addresses(list) => list.clone(),
        }
    }
}

/// Table of listening endpoints
#[derive(Debug)]
pub struct InstanceRegistry {
    arena: Arena<Instance>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    /// Register a listening endpoint, refusing a clash with an existing one.
    pub fn register(&mut self, spec: InstanceSpec) -> Result<InstanceId> {
        if self
            .arena
            .iter()
            .any(|inst| inst.conflicts_with(spec.local_port, &spec.binding))
        {
            return Err(ProtocolError::Registry(format!(
                "{} (port {})",
                constants::ERR_DUPLICATE_BIND,
                spec.local_port
            )));
        }
        let port = spec.local_port;
        let supported = spec.supported;
        let id = InstanceId(self.arena.insert_with(|slot| Instance {
            id: InstanceId(slot),
            local_port: spec.local_port,
            binding: spec.binding,
            supported: spec.supported,
            inbound_streams: spec.inbound_streams,
            outbound_streams: spec.outbound_streams,
            events: spec.events,
        }));
        info!(instance = %id, port, %supported, "Instance registered");
        Ok(id)
    }

    pub fn unregister(&mut self, id: InstanceId) -> Result<Instance> {
        let instance = self
            .arena
            .remove(id.0)
            .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_INSTANCE.into()))?;
        info!(instance = %id, port = instance.local_port, "Instance unregistered");
        Ok(instance)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.arena.get(id.0)
    }

    /// Replace an explicit address list, under the same clash rules as
    /// [`register`](Self::register).
    pub fn rebind(&mut self, id: InstanceId, addresses: Vec<IpAddr>) -> Result<()> {
        let port = self
            .get(id)
            .map(|inst| inst.local_port)
            .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_INSTANCE.into()))?;
        let binding = Binding::Addresses(addresses);
        if self
            .arena
            .iter()
            .any(|inst| inst.id != id && inst.conflicts_with(port, &binding))
        {
            return Err(ProtocolError::Registry(format!(
                "{} (port {port})",
                constants::ERR_DUPLICATE_BIND
            )));
        }
        if let Some(instance) = self.arena.get_mut(id.0) {
            instance.binding = binding;
        }
        debug!(instance = %id, port, "Instance rebound");
        Ok(())
    }

    /// Instance listening on `local`'s port and accepting its address.
    pub fn find_by_transport_addr(
        &self,
        local: &SocketAddr,
        address_type: AddressTypes,
    ) -> Option<InstanceId> {
        let ip = local.ip();
        self.arena
            .iter()
            .find(|inst| inst.local_port == local.port() && inst.binding.accepts(&ip, address_type))
            .map(|inst| inst.id)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Association lifecycle. A missing Channel is the implicit Closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    CookieWait,
    CookieEchoed,
    Connected,
    ShutdownPending,
    ShutdownReceived,
    ShutdownSent,
    ShutdownAckSent,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CookieWait => "COOKIE-WAIT",
            Self::CookieEchoed => "COOKIE-ECHOED",
            Self::Connected => "ESTABLISHED",
            Self::ShutdownPending => "SHUTDOWN-PENDING",
            Self::ShutdownReceived => "SHUTDOWN-RECEIVED",
            Self::ShutdownSent => "SHUTDOWN-SENT",
            Self::ShutdownAckSent => "SHUTDOWN-ACK-SENT",
        };
        f.write_str(name)
    }
}

/// Association control block
#[derive(Debug)]
pub struct Channel {
    pub id: ChannelId,
    pub instance: InstanceId,
    pub local_port: u16,
    pub remote_port: u16,
    pub local_tag: u32,
    pub remote_tag: u32,
    pub local_addresses: Vec<IpAddr>,
    pub remote_addresses: Vec<IpAddr>,
    pub state: ChannelState,
    pub local_tie_tag: u32,
    pub peer_tie_tag: u32,
    pub inbound_streams: u16,
    pub outbound_streams: u16,
    pub peer_rwnd: u32,
    pub local_initial_tsn: u32,
    pub peer_initial_tsn: u32,
    /// Families the peer accepts
    pub peer_supported: AddressTypes,
    /// Fixed fields of the INIT this side sent, kept while forming
    pub own_init: Option<InitFixed>,
    pub primary_path: usize,
    /// Source of the most recent packet for this association
    pub last_source: Option<IpAddr>,
    /// Peer supplied a host name; resolution is deferred to the caller
    pub pending_dns: bool,
    pub bundle: BundleBuffer,
    deleted: bool,
}

impl Channel {
    fn new(
        id: ChannelId,
        instance: InstanceId,
        local_port: u16,
        remote_port: u16,
        bundle_ceiling: usize,
    ) -> Self {
        Self {
            id,
            instance,
            local_port,
            remote_port,
            local_tag: 0,
            remote_tag: 0,
            local_addresses: Vec::new(),
            remote_addresses: Vec::new(),
            state: ChannelState::CookieWait,
            local_tie_tag: 0,
            peer_tie_tag: 0,
            inbound_streams: 0,
            outbound_streams: 0,
            peer_rwnd: 0,
            local_initial_tsn: 0,
            peer_initial_tsn: 0,
            peer_supported: AddressTypes::NONE,
            own_init: None,
            primary_path: 0,
            last_source: None,
            pending_dns: false,
            bundle: BundleBuffer::new(bundle_ceiling),
            deleted: false,
        }
    }

    pub fn tie_tags_set(&self) -> bool {
        self.local_tie_tag != 0 && self.peer_tie_tag != 0
    }

    pub fn tie_tags_clear(&self) -> bool {
        self.local_tie_tag == 0 && self.peer_tie_tag == 0
    }

    pub fn has_remote_address(&self, addr: &IpAddr) -> bool {
        self.remote_addresses.contains(addr)
    }

    fn matches(&self, remote: &IpAddr, remote_port: u16, local_port: u16) -> bool {
        !self.deleted
            && self.remote_port == remote_port
            && self.local_port == local_port
            && self.has_remote_address(remote)
    }
}

/// Table of associations
#[derive(Debug)]
pub struct ChannelRegistry {
    arena: Arena<Channel>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    /// Allocate a Channel in COOKIE-WAIT with zeroed tags.
    pub fn insert(
        &mut self,
        instance: InstanceId,
        local_port: u16,
        remote_port: u16,
        bundle_ceiling: usize,
    ) -> ChannelId {
        let id = ChannelId(self.arena.insert_with(|slot| {
            Channel::new(ChannelId(slot), instance, local_port, remote_port, bundle_ceiling)
        }));
        debug!(channel = %id, local_port, remote_port, "Channel allocated");
        id
    }

    /// Live channel; soft-deleted entries are not found.
    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.arena.get(id.0).filter(|ch| !ch.deleted)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.arena.get_mut(id.0).filter(|ch| !ch.deleted)
    }

    /// Hide a channel from lookups. Its slot is reclaimed by [`Self::sweep`].
    pub fn mark_deleted(&mut self, id: ChannelId) -> bool {
        match self.arena.get_mut(id.0) {
            Some(ch) if !ch.deleted => {
                ch.deleted = true;
                debug!(channel = %id, "Channel marked deleted");
                true
            }
            _ => false,
        }
    }

    /// Reclaim every soft-deleted slot. Returns the number reclaimed.
    pub fn sweep(&mut self) -> usize {
        let doomed: Vec<ChannelId> = self
            .arena
            .iter()
            .filter(|ch| ch.deleted)
            .map(|ch| ch.id)
            .collect();
        for id in &doomed {
            self.arena.remove(id.0);
        }
        if !doomed.is_empty() {
            debug!(reclaimed = doomed.len(), "Swept deleted channels");
        }
        doomed.len()
    }

    /// Channel with matching ports that has `remote` among its peer addresses.
    pub fn find_by_transport_addr(
        &self,
        remote: &IpAddr,
        remote_port: u16,
        local_port: u16,
    ) -> Option<ChannelId> {
        self.arena
            .iter()
            .find(|ch| ch.matches(remote, remote_port, local_port))
            .map(|ch| ch.id)
    }

    /// First channel matching any of `remotes`.
    pub fn find_by_any_address(
        &self,
        remotes: &[IpAddr],
        remote_port: u16,
        local_port: u16,
    ) -> Option<ChannelId> {
        remotes
            .iter()
            .find_map(|addr| self.find_by_transport_addr(addr, remote_port, local_port))
    }

    /// Live channels owned by an instance
    pub fn count_for_instance(&self, instance: InstanceId) -> usize {
        self.iter().filter(|ch| ch.instance == instance).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.arena.iter().filter(|ch| !ch.deleted)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.arena.iter_mut().filter(|ch| !ch.deleted)
    }

    /// Live channels
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slots, deleted ones included
    pub fn allocated(&self) -> usize {
        self.arena.len()
    }
}
