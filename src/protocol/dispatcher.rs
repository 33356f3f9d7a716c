//! Inbound packet dispatch.
//!
//! [`Dispatcher::on_packet`] takes one datagram through validation,
//! classification, association lookup, the verification-tag rules and the
//! out-of-the-blue rules, then hands the surviving chunks to the handshake
//! handlers in [`crate::protocol::handshake`]. Everything that must go back to
//! the peer is bundled and sent before `on_packet` returns.
//!
//! Malformed or illegal traffic is never an error: it is reported as a
//! [`Disposition`] and logged at debug level. `Err` is reserved for internal
//! inconsistencies and local failures.

use crate::config::GecoConfig;
use crate::core::builder;
use crate::core::chunk::{id, Chunk, ChunkIter, UnrecognizedAction};
use crate::core::packet::{CommonHeader, CHUNK_HEADER_SIZE, COMMON_HEADER_SIZE};
use crate::core::param::{self, cause, kind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::address::{canonical, AddressTypes};
use crate::protocol::bundler::{BundleBuffer, FlushOutcome, OutboundBundle, Region};
use crate::protocol::classifier::{self, Occurrence};
use crate::protocol::cookie::{CookieCodec, SecretKey};
use crate::protocol::events::{AssociationUp, LossReason};
use crate::protocol::registry::{
    Binding, Channel, ChannelId, ChannelRegistry, ChannelState, InstanceId, InstanceRegistry,
    InstanceSpec,
};
use crate::protocol::sender::{PacketSender, Route};
use crate::protocol::validator::{self, Rejection};
use crate::transport::Transport;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::time::Clock;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, instrument, trace, warn};

/// Process-wide dispatch state: configuration, the cookie secret, the random
/// source for tags and the metrics sink.
#[derive(Debug)]
pub struct DispatchContext {
    config: GecoConfig,
    cookies: CookieCodec,
    rng: StdRng,
    metrics: Metrics,
    clock: Clock,
}

impl DispatchContext {
    /// Seed from the operating system and generate a fresh cookie secret.
    pub fn new(config: GecoConfig) -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|e| {
            ProtocolError::Custom(format!("{}: {e}", constants::ERR_RANDOM_SEED))
        })?;
        Ok(Self::from_rng(config, StdRng::from_seed(seed)))
    }

    /// Deterministic context for tests and benchmarks.
    pub fn with_seed(config: GecoConfig, seed: u64) -> Self {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: GecoConfig, mut rng: StdRng) -> Self {
        let cookies = CookieCodec::new(SecretKey::generate(&mut rng));
        Self {
            config,
            cookies,
            rng,
            metrics: Metrics::new(),
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GecoConfig {
        &self.config
    }

    pub fn cookies(&self) -> &CookieCodec {
        &self.cookies
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Non-zero random value, as required for verification tags.
    pub(crate) fn random_tag(&mut self) -> u32 {
        loop {
            let tag = self.rng.next_u32();
            if tag != 0 {
                return tag;
            }
        }
    }

    pub(crate) fn random_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    /// Current time in ms, truncated to the 32 bits carried in a cookie.
    pub(crate) fn now_ms(&self) -> Result<u32> {
        Ok(self.clock.now_ms()? as u32)
    }
}

/// Why a packet was dropped without a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Rejected by the packet validator
    Invalid(Rejection),
    /// Chunk or parameter lengths do not add up
    Malformed,
    /// INIT, INIT-ACK or SHUTDOWN-COMPLETE bundled with other chunks
    ExclusiveChunk,
    VerificationTag,
    /// Chunk not acceptable in the association's current state
    WrongState,
    OutOfTheBlue,
    InvalidCookie,
    UnrecognizedChunk,
    UnrecognizedParameter,
}

/// What `on_packet` did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Discarded(DiscardReason),
    /// An ABORT went out, carrying this cause code if any
    Aborted(Option<u16>),
    /// Answered without further processing
    Replied,
    /// INIT from a peer that tried to restart with new addresses
    RestartRejected,
    /// Chunks were handed to their handlers
    Processed,
}

impl Disposition {
    pub(crate) fn discard(reason: DiscardReason) -> Self {
        Self::Discarded(reason)
    }
}

/// ABORT and SHUTDOWN-COMPLETE tag rule: with T clear the packet carries our
/// tag, with T set it carries the peer's own tag.
pub fn abort_tag_accepted(t_bit: bool, tag: u32, local_tag: u32, remote_tag: u32) -> bool {
    (!t_bit && tag == local_tag) || (t_bit && tag == remote_tag)
}

/// Addressing of the packet being processed
#[derive(Debug, Clone, Copy)]
pub(crate) struct PacketMeta {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub header: CommonHeader,
    /// Initiate tag of a received INIT, stamped on the INIT-ACK answering it
    pub peer_init_tag: Option<u32>,
}

impl PacketMeta {
    /// Reply straight back to the packet source under `tag`.
    pub fn reflect(&self, tag: u32) -> Target {
        Target::Ootb {
            tag,
            local_port: self.header.dst_port,
            remote_port: self.header.src_port,
            destination: self.source,
        }
    }
}

/// Where outbound chunks are bundled
#[derive(Debug, Clone, Copy)]
pub(crate) enum Target {
    /// Shared buffer for replies that belong to no association
    Ootb {
        tag: u32,
        local_port: u16,
        remote_port: u16,
        destination: SocketAddr,
    },
    Channel(ChannelId),
}

/// Result of one chunk handler
pub(crate) enum Flow {
    Continue,
    /// Continue with a channel created by this packet
    Established(ChannelId),
    Stop(Disposition),
}

/// The dispatch layer: registries, bundling and the state machine driving them.
#[derive(Debug)]
pub struct Dispatcher<T: Transport> {
    pub(crate) ctx: DispatchContext,
    pub(crate) instances: InstanceRegistry,
    pub(crate) channels: ChannelRegistry,
    pub(crate) ootb: BundleBuffer,
    pub(crate) sender: PacketSender,
    pub(crate) transport: T,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(ctx: DispatchContext, transport: T) -> Self {
        let bundling = &ctx.config.bundling;
        let ootb = BundleBuffer::new(bundling.chunk_ceiling());
        let sender = PacketSender::new(bundling.max_packet_size());
        Self {
            ctx,
            instances: InstanceRegistry::new(),
            channels: ChannelRegistry::new(),
            ootb,
            sender,
            transport,
        }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.ctx
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    #[instrument(level = "debug", skip(self, spec), fields(port = spec.local_port))]
    pub fn register_instance(&mut self, spec: InstanceSpec) -> Result<InstanceId> {
        self.instances.register(spec)
    }

    /// Remove an instance. Refused while it still owns live channels.
    pub fn unregister_instance(&mut self, id: InstanceId) -> Result<()> {
        if self.channels.count_for_instance(id) > 0 {
            return Err(ProtocolError::Registry(
                constants::ERR_INSTANCE_IN_USE.into(),
            ));
        }
        self.instances.unregister(id).map(|_| ())
    }

    /// Reclaim soft-deleted channels. Call between dispatch iterations.
    pub fn sweep(&mut self) -> usize {
        self.channels.sweep()
    }

    /// Start an association: send INIT to every remote address and wait in
    /// COOKIE-WAIT.
    #[instrument(level = "debug", skip(self, remotes), fields(remotes = remotes.len()))]
    pub fn connect(
        &mut self,
        instance: InstanceId,
        remote_port: u16,
        remotes: &[IpAddr],
        outbound_streams: u16,
        inbound_streams: u16,
    ) -> Result<ChannelId> {
        if remotes.is_empty() {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_NO_REMOTE_ADDRESS.into(),
            ));
        }
        if outbound_streams == 0 || inbound_streams == 0 {
            return Err(ProtocolError::HandshakeError(
                "Stream counts must be non-zero".into(),
            ));
        }
        let inst = self
            .instances
            .get(instance)
            .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_INSTANCE.into()))?;
        let local_port = inst.local_port;

        let mut remote_addresses: Vec<IpAddr> = Vec::with_capacity(remotes.len());
        for addr in remotes.iter().copied().map(canonical) {
            if !inst.supported.supports(&addr) {
                return Err(ProtocolError::AddressFamily(format!(
                    "{addr} is not in the instance's families ({})",
                    inst.supported
                )));
            }
            if !remote_addresses.contains(&addr) {
                remote_addresses.push(addr);
            }
        }
        if self
            .channels
            .find_by_any_address(&remote_addresses, remote_port, local_port)
            .is_some()
        {
            return Err(ProtocolError::Registry(format!(
                "Association to port {remote_port} already exists"
            )));
        }

        let mut params = builder::supported_address_types(
            inst.supported.contains(AddressTypes::IPV4),
            inst.supported.contains(AddressTypes::IPV6),
        )?;
        let local_addresses = match &inst.binding {
            Binding::Addresses(list) => list.clone(),
            Binding::Any(_) => Vec::new(),
        };
        for addr in &local_addresses {
            param::write_address(&mut params, addr)?;
        }

        let tag = self.ctx.random_tag();
        let own = crate::core::chunk::InitFixed {
            init_tag: tag,
            rwnd: self.ctx.config.endpoint.rwnd,
            outbound_streams,
            inbound_streams,
            initial_tsn: self.ctx.random_u32(),
        };
        let init = builder::init(id::INIT, &own, &params)?;

        let ceiling = self.ctx.config.bundling.chunk_ceiling();
        let channel = self
            .channels
            .insert(instance, local_port, remote_port, ceiling);
        let ch = self.channel_mut_or_err(channel)?;
        ch.local_tag = tag;
        ch.local_initial_tsn = own.initial_tsn;
        ch.own_init = Some(own);
        ch.local_addresses = local_addresses;
        ch.remote_addresses = remote_addresses;

        let count = ch.remote_addresses.len();
        for index in 0..count {
            let ch = self.channel_mut_or_err(channel)?;
            if let Some(overflow) = ch.bundle.bundle(Region::Control, &init, Some(index))? {
                self.transmit(Target::Channel(channel), overflow, None)?;
            }
            self.finish(channel, None)?;
        }

        info!(%channel, remote_port, tag, "INIT sent, entering COOKIE-WAIT");
        Ok(channel)
    }

    /// Abort an association: send ABORT, notify the application, delete it.
    #[instrument(level = "debug", skip(self))]
    pub fn abort(&mut self, channel: ChannelId, cause_code: Option<u16>) -> Result<()> {
        if self.channels.get(channel).is_none() {
            return Err(ProtocolError::Registry(
                constants::ERR_UNKNOWN_CHANNEL.into(),
            ));
        }
        self.send_abort(Target::Channel(channel), false, cause_code, &[], None)?;
        self.delete_channel(channel, LossReason::LocalAbort)
    }

    /// Process one inbound packet received from `source` on `destination`.
    #[instrument(level = "trace", skip(self, bytes), fields(len = bytes.len()))]
    pub fn on_packet(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Disposition> {
        let _timer = Timer::start("on_packet");
        self.ctx.metrics.packet_received(bytes.len() as u64);

        let outcome = self.dispatch(bytes, source, destination);
        match &outcome {
            Ok(Disposition::Discarded(reason)) => {
                self.ctx.metrics.packet_discarded();
                debug!(%source, ?reason, "Packet discarded");
            }
            Ok(disposition) => trace!(%source, ?disposition, "Packet handled"),
            Err(ProtocolError::InvariantViolation(msg)) => {
                self.ctx.metrics.invariant_violation();
                error!(%source, error = %msg, "Internal invariant violated, packet dropped");
                self.drop_pending();
            }
            Err(e) => {
                warn!(%source, error = %e, "Packet processing failed");
                self.drop_pending();
            }
        }
        outcome
    }

    fn dispatch(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Disposition> {
        let max_size = self.ctx.config.bundling.max_packet_size();
        let header = match validator::validate(bytes, &source, &destination, max_size) {
            Ok(header) => header,
            Err(rejection) => {
                return Ok(Disposition::discard(DiscardReason::Invalid(rejection)));
            }
        };
        let chain = &bytes[COMMON_HEADER_SIZE..];
        let source_ip = source.ip();

        let mut channel =
            self.channels
                .find_by_transport_addr(&source_ip, header.src_port, header.dst_port);
        let mut instance = match channel {
            Some(id) => Some(self.owning_instance(id)?),
            None => self.instances.find_by_transport_addr(
                &SocketAddr::new(destination.ip(), header.dst_port),
                AddressTypes::of(&destination.ip()),
            ),
        };

        let types = classifier::classify(chain);
        if !types.is_complete() {
            return Ok(Disposition::discard(DiscardReason::Malformed));
        }
        for exclusive in [id::INIT, id::INIT_ACK, id::SHUTDOWN_COMPLETE] {
            if types.occurrences(exclusive) == Occurrence::Among {
                return Ok(Disposition::discard(DiscardReason::ExclusiveChunk));
            }
        }
        let chunks = match ChunkIter::new(chain)
            .map(|raw| raw.and_then(Chunk::parse))
            .collect::<Result<Vec<_>>>()
        {
            Ok(chunks) => chunks,
            Err(e) => {
                trace!(error = %e, "Chunk failed to parse");
                return Ok(Disposition::discard(DiscardReason::Malformed));
            }
        };

        // The peer may have moved to an address we only know from its INIT
        if channel.is_none() {
            if let Some(Chunk::Init(init) | Chunk::InitAck(init)) = chunks.first() {
                let local_types = instance
                    .and_then(|i| self.instances.get(i))
                    .map(|i| i.supported)
                    .unwrap_or_else(|| self.ctx.config.endpoint.address_types());
                if let Ok(peer) =
                    crate::protocol::address::read_peer_addresses(init.params, source_ip, local_types)
                {
                    channel = self.channels.find_by_any_address(
                        &peer.addresses,
                        header.src_port,
                        header.dst_port,
                    );
                    if let Some(id) = channel {
                        debug!(%id, "Association recovered from peer address list");
                        instance = Some(self.owning_instance(id)?);
                    }
                }
            }
        }

        let meta = PacketMeta {
            source,
            destination,
            header,
            peer_init_tag: match chunks.first() {
                Some(Chunk::Init(init)) => Some(init.fixed.init_tag),
                _ => None,
            },
        };

        let early = match channel {
            Some(id) => self.check_verification_tags(id, &chunks, &meta)?,
            None => self.check_out_of_the_blue(instance, &types, chain, &chunks, &meta)?,
        };
        if let Some(disposition) = early {
            return Ok(disposition);
        }

        self.process_chunks(channel, instance, &chunks, &meta)
    }

    /// Verification tag exceptions for a packet that matched an association.
    fn check_verification_tags(
        &mut self,
        channel: ChannelId,
        chunks: &[Chunk<'_>],
        meta: &PacketMeta,
    ) -> Result<Option<Disposition>> {
        let tag = meta.header.verification_tag;
        let (local_tag, remote_tag, state) = {
            let ch = self.channel_or_err(channel)?;
            (ch.local_tag, ch.remote_tag, ch.state)
        };

        let mut tag_exempt = false;
        let mut host_name = false;
        for chunk in chunks {
            match chunk {
                Chunk::Init(init) => {
                    if tag != 0 {
                        return self
                            .send_abort(
                                meta.reflect(init.fixed.init_tag),
                                false,
                                Some(cause::INIT_VER_TAG_NOT_ZERO),
                                &[],
                                None,
                            )
                            .map(Some);
                    }
                    tag_exempt = true;
                }
                Chunk::Abort { t_bit, .. } => {
                    if !abort_tag_accepted(*t_bit, tag, local_tag, remote_tag) {
                        return Ok(Some(Disposition::discard(DiscardReason::VerificationTag)));
                    }
                    tag_exempt = true;
                }
                Chunk::ShutdownComplete { t_bit } => {
                    if !abort_tag_accepted(*t_bit, tag, local_tag, remote_tag) {
                        return Ok(Some(Disposition::discard(DiscardReason::VerificationTag)));
                    }
                    // Closes the association from either side of the shutdown sequence
                    if !matches!(
                        state,
                        ChannelState::ShutdownAckSent | ChannelState::ShutdownSent
                    ) {
                        return Ok(Some(Disposition::discard(DiscardReason::WrongState)));
                    }
                    tag_exempt = true;
                }
                Chunk::ShutdownAck => match state {
                    ChannelState::CookieWait | ChannelState::CookieEchoed => {
                        let sc = builder::shutdown_complete(true)?;
                        self.reply_ootb(meta.reflect(tag), &sc)?;
                        return Ok(Some(Disposition::Replied));
                    }
                    ChannelState::ShutdownPending => {}
                    _ => return Ok(Some(Disposition::discard(DiscardReason::WrongState))),
                },
                Chunk::InitAck(init) => {
                    if state != ChannelState::CookieWait {
                        return Ok(Some(Disposition::discard(DiscardReason::WrongState)));
                    }
                    host_name |= param::find_param(init.params, kind::HOST_NAME).is_some();
                }
                _ => {}
            }
        }

        if !tag_exempt && tag != local_tag {
            return Ok(Some(Disposition::discard(DiscardReason::VerificationTag)));
        }

        let ch = self.channel_mut_or_err(channel)?;
        ch.last_source = Some(meta.source.ip());
        if host_name {
            debug!(%channel, "Peer sent a host name, resolution deferred");
            ch.pending_dns = true;
        }
        Ok(None)
    }

    /// Out-of-the-blue rules for a packet that matched no association.
    fn check_out_of_the_blue(
        &mut self,
        instance: Option<InstanceId>,
        types: &classifier::ChunkTypes,
        chain: &[u8],
        chunks: &[Chunk<'_>],
        meta: &PacketMeta,
    ) -> Result<Option<Disposition>> {
        let tag = meta.header.verification_tag;

        if types.contains(id::ABORT) {
            return Ok(Some(Disposition::discard(DiscardReason::OutOfTheBlue)));
        }
        if types.contains(id::SHUTDOWN_ACK) {
            let sc = builder::shutdown_complete(true)?;
            self.reply_ootb(meta.reflect(tag), &sc)?;
            return Ok(Some(Disposition::Replied));
        }
        if types.contains(id::SHUTDOWN_COMPLETE)
            || types.contains(id::COOKIE_ACK)
            || classifier::contains_error_cause(chain, cause::STALE_COOKIE)
        {
            return Ok(Some(Disposition::discard(DiscardReason::OutOfTheBlue)));
        }

        if let Some(Chunk::Init(init)) = chunks.first() {
            if tag != 0 {
                return Ok(Some(Disposition::discard(DiscardReason::VerificationTag)));
            }
            if instance.is_none() {
                return self
                    .ootb_abort(meta.reflect(init.fixed.init_tag), Some(cause::PEER_INSTANCE_NOT_FOUND))
                    .map(Some);
            }
            return Ok(None);
        }

        if types.contains(id::COOKIE_ECHO) {
            if !matches!(chunks.first(), Some(Chunk::CookieEcho { .. })) {
                return Ok(Some(Disposition::discard(DiscardReason::OutOfTheBlue)));
            }
            let listening = instance
                .and_then(|i| self.instances.get(i))
                .is_some_and(|inst| inst.local_port == meta.header.dst_port);
            if listening {
                return Ok(None);
            }
            return self.ootb_abort(meta.reflect(tag), None).map(Some);
        }

        self.ootb_abort(meta.reflect(tag), None).map(Some)
    }

    /// Hand every chunk to its handler.
    fn process_chunks(
        &mut self,
        mut channel: Option<ChannelId>,
        instance: Option<InstanceId>,
        chunks: &[Chunk<'_>],
        meta: &PacketMeta,
    ) -> Result<Disposition> {
        if let Some(id) = channel {
            self.channel_mut_or_err(id)?.bundle.lock();
        }

        let mut disposition = Disposition::Processed;
        for chunk in chunks {
            let flow = match chunk {
                Chunk::Data(raw) => {
                    trace!(len = raw.value.len(), "DATA handled outside the dispatch layer");
                    Flow::Continue
                }
                Chunk::Sack(raw) => {
                    trace!(len = raw.value.len(), "SACK handled outside the dispatch layer");
                    Flow::Continue
                }
                Chunk::Passthrough(raw) => {
                    trace!(chunk_id = raw.chunk_id(), "Chunk handled outside the dispatch layer");
                    Flow::Continue
                }
                Chunk::Init(init) => {
                    let owner = match (channel, instance) {
                        (Some(id), _) => self.owning_instance(id)?,
                        (None, Some(inst)) => inst,
                        (None, None) => {
                            return Ok(Disposition::discard(DiscardReason::OutOfTheBlue))
                        }
                    };
                    Flow::Stop(self.process_init_chunk(owner, channel, init, meta)?)
                }
                Chunk::InitAck(init) => match channel {
                    Some(id) => Flow::Stop(self.process_init_ack_chunk(id, init, meta)?),
                    None => Flow::Stop(Disposition::discard(DiscardReason::OutOfTheBlue)),
                },
                Chunk::CookieEcho { cookie } => {
                    self.process_cookie_echo_chunk(instance, channel, cookie, meta)?
                }
                Chunk::CookieAck => {
                    if let Some(id) = channel {
                        self.process_cookie_ack_chunk(id)?;
                    }
                    Flow::Continue
                }
                Chunk::Abort { causes, .. } => {
                    if let Some(id) = channel {
                        log_causes("ABORT", causes);
                        self.delete_channel(id, LossReason::PeerAbort)?;
                    }
                    Flow::Stop(Disposition::Processed)
                }
                Chunk::ShutdownComplete { .. } => {
                    if let Some(id) = channel {
                        self.delete_channel(id, LossReason::ShutdownComplete)?;
                    }
                    Flow::Stop(Disposition::Processed)
                }
                Chunk::ShutdownAck => {
                    if let Some(id) = channel {
                        let sc = builder::shutdown_complete(false)?;
                        self.bundle_into(Target::Channel(id), Region::Control, &sc, None)?;
                        self.delete_channel(id, LossReason::ShutdownComplete)?;
                    }
                    Flow::Stop(Disposition::Replied)
                }
                Chunk::Error { causes } => {
                    log_causes("ERROR", causes);
                    Flow::Continue
                }
                Chunk::Unrecognized(raw) => {
                    let action = UnrecognizedAction::for_chunk(raw.chunk_id());
                    debug!(chunk_id = raw.chunk_id(), ?action, "Unrecognized chunk");
                    if action.reports() {
                        if let Some(id) = channel {
                            let report = param::encode_cause(
                                cause::UNRECOGNIZED_CHUNK_TYPE,
                                &raw.wire[..CHUNK_HEADER_SIZE],
                            )?;
                            let error_chunk = builder::error(&report)?;
                            self.bundle_into(Target::Channel(id), Region::Control, &error_chunk, None)?;
                        }
                    }
                    match action {
                        UnrecognizedAction::Stop => {
                            Flow::Stop(Disposition::discard(DiscardReason::UnrecognizedChunk))
                        }
                        UnrecognizedAction::StopAndReport => Flow::Stop(Disposition::Replied),
                        UnrecognizedAction::Skip | UnrecognizedAction::SkipAndReport => {
                            Flow::Continue
                        }
                    }
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Established(id) => channel = Some(id),
                Flow::Stop(stop) => {
                    disposition = stop;
                    break;
                }
            }
        }

        if let Some(id) = channel {
            self.finish(id, meta.peer_init_tag)?;
        }
        Ok(disposition)
    }

    pub(crate) fn channel_or_err(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(id)
            .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_CHANNEL.into()))
    }

    pub(crate) fn channel_mut_or_err(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels
            .get_mut(id)
            .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_CHANNEL.into()))
    }

    /// Instance owning a channel; a dangling owner is an internal error.
    pub(crate) fn owning_instance(&self, id: ChannelId) -> Result<InstanceId> {
        let instance = self.channel_or_err(id)?.instance;
        if self.instances.get(instance).is_none() {
            return Err(ProtocolError::InvariantViolation(format!(
                "{} ({id})",
                constants::ERR_CHANNEL_WITHOUT_INSTANCE
            )));
        }
        Ok(instance)
    }

    /// Append a chunk to a buffer, sending whatever it pushes out.
    pub(crate) fn bundle_into(
        &mut self,
        target: Target,
        region: Region,
        chunk: &[u8],
        peer_init_tag: Option<u32>,
    ) -> Result<()> {
        let overflow = match target {
            Target::Ootb { .. } => self.ootb.bundle(region, chunk, None)?,
            Target::Channel(id) => self.channel_mut_or_err(id)?.bundle.bundle(region, chunk, None)?,
        };
        if let Some(bundle) = overflow {
            self.transmit(target, bundle, peer_init_tag)?;
        }
        Ok(())
    }

    /// Send one chunk back to the source of a packet with no association.
    pub(crate) fn reply_ootb(&mut self, target: Target, chunk: &[u8]) -> Result<()> {
        self.bundle_into(target, Region::Control, chunk, None)?;
        if let FlushOutcome::Ready(bundle) = self.ootb.flush(None) {
            self.transmit(target, bundle, None)?;
        }
        Ok(())
    }

    /// Release a channel's buffer: unlock, flush, send.
    pub(crate) fn finish(&mut self, id: ChannelId, peer_init_tag: Option<u32>) -> Result<()> {
        let Some(ch) = self.channels.get_mut(id) else {
            return Ok(());
        };
        let deferred = ch.bundle.unlock();
        let remaining = ch.bundle.flush(None);
        if let Some(bundle) = deferred {
            self.transmit(Target::Channel(id), bundle, peer_init_tag)?;
        }
        if let FlushOutcome::Ready(bundle) = remaining {
            self.transmit(Target::Channel(id), bundle, peer_init_tag)?;
        }
        Ok(())
    }

    fn transmit(
        &mut self,
        target: Target,
        bundle: OutboundBundle,
        peer_init_tag: Option<u32>,
    ) -> Result<()> {
        let route = match target {
            Target::Ootb {
                tag,
                local_port,
                remote_port,
                destination,
            } => Route::Reflect {
                verification_tag: tag,
                local_port,
                remote_port,
                destination,
            },
            Target::Channel(id) => Route::Channel {
                channel: self
                    .channels
                    .get(id)
                    .ok_or_else(|| ProtocolError::Registry(constants::ERR_UNKNOWN_CHANNEL.into()))?,
                explicit: bundle.destination,
                peer_init_tag,
            },
        };
        let delivered = self
            .sender
            .send(&mut self.transport, &bundle.chunks, route)?;
        self.ctx.metrics.packet_sent(
            (bundle.chunks.len() + COMMON_HEADER_SIZE) as u64,
            delivered,
        );
        Ok(())
    }

    /// Send an ABORT, optionally carrying one error cause.
    pub(crate) fn send_abort(
        &mut self,
        target: Target,
        t_bit: bool,
        cause_code: Option<u16>,
        info: &[u8],
        peer_init_tag: Option<u32>,
    ) -> Result<Disposition> {
        let encoded = cause_code
            .map(|code| param::encode_cause(code, info))
            .transpose()?;
        let chunk = builder::abort(t_bit, encoded.as_deref())?;
        match target {
            Target::Ootb { .. } => self.reply_ootb(target, &chunk)?,
            Target::Channel(id) => {
                self.bundle_into(target, Region::Control, &chunk, peer_init_tag)?;
                self.finish(id, peer_init_tag)?;
            }
        }
        self.ctx.metrics.abort_sent();
        debug!(cause = ?cause_code, t_bit, "ABORT sent");
        Ok(Disposition::Aborted(cause_code))
    }

    /// ABORT in answer to an out-of-the-blue packet, if configured to answer.
    fn ootb_abort(&mut self, target: Target, cause_code: Option<u16>) -> Result<Disposition> {
        if !self.ctx.config.endpoint.send_abort_for_ootb {
            return Ok(Disposition::discard(DiscardReason::OutOfTheBlue));
        }
        self.send_abort(target, false, cause_code, &[], None)
    }

    /// Flush, soft-delete and report a lost association.
    pub(crate) fn delete_channel(&mut self, id: ChannelId, reason: LossReason) -> Result<()> {
        self.finish(id, None)?;
        let instance = self.channel_or_err(id)?.instance;
        if !self.channels.mark_deleted(id) {
            return Ok(());
        }
        self.ctx.metrics.association_lost();
        info!(channel = %id, ?reason, "Association removed");
        if let Some(events) = self.instances.get(instance).and_then(|i| i.events.clone()) {
            events.on_association_lost(id, reason);
        }
        Ok(())
    }

    pub(crate) fn notify_up(&self, id: ChannelId) -> Result<()> {
        let ch = self.channel_or_err(id)?;
        let Some(events) = self.instances.get(ch.instance).and_then(|i| i.events.clone()) else {
            return Ok(());
        };
        let info = AssociationUp {
            remote_port: ch.remote_port,
            remote_addresses: ch.remote_addresses.clone(),
            outbound_streams: ch.outbound_streams,
            inbound_streams: ch.inbound_streams,
        };
        events.on_association_up(id, &info);
        Ok(())
    }

    pub(crate) fn notify_restart(&self, id: ChannelId) -> Result<()> {
        let ch = self.channel_or_err(id)?;
        if let Some(events) = self.instances.get(ch.instance).and_then(|i| i.events.clone()) {
            events.on_peer_restart(id);
        }
        Ok(())
    }

    /// Throw away anything composed for a packet that failed midway.
    fn drop_pending(&mut self) {
        self.ootb.unlock();
        let _ = self.ootb.flush(None);
        for ch in self.channels.iter_mut() {
            if ch.bundle.is_locked() {
                ch.bundle.unlock();
                let _ = ch.bundle.flush(None);
            }
        }
    }
}

fn log_causes(chunk: &str, causes: &[u8]) {
    for cause in param::ParamIter::new(causes).map_while(|c| c.ok()) {
        debug!(chunk, cause = cause.param_type, len = cause.value.len(), "Peer reported error cause");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::encode_packet;
    use crate::transport::memory::MemoryTransport;

    fn dispatcher() -> Dispatcher<MemoryTransport> {
        let ctx = DispatchContext::with_seed(GecoConfig::default(), 7);
        Dispatcher::new(ctx, MemoryTransport::new())
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_abort_tag_predicate() {
        assert!(abort_tag_accepted(false, 10, 10, 20));
        assert!(abort_tag_accepted(true, 20, 10, 20));
        assert!(!abort_tag_accepted(false, 20, 10, 20));
        assert!(!abort_tag_accepted(true, 10, 10, 20));
    }

    #[test]
    fn test_random_tag_never_zero() {
        let mut ctx = DispatchContext::with_seed(GecoConfig::default(), 1);
        for _ in 0..1000 {
            assert_ne!(ctx.random_tag(), 0);
        }
    }

    #[test]
    fn test_bad_checksum_discarded() {
        let mut d = dispatcher();
        let mut packet =
            encode_packet(&CommonHeader::new(1, 2, 0), &builder::cookie_ack().unwrap()).unwrap();
        packet[12] ^= 0xFF;
        let outcome = d
            .on_packet(&packet, addr("10.0.0.1:1"), addr("10.0.0.2:2"))
            .unwrap();
        assert_eq!(
            outcome,
            Disposition::Discarded(DiscardReason::Invalid(Rejection::Checksum))
        );
        assert!(d.transport().sent().is_empty());
        assert_eq!(d.metrics().snapshot().packets_discarded, 1);
    }

    #[test]
    fn test_truncated_chain_discarded() {
        let mut d = dispatcher();
        // COOKIE-ACK claiming 8 bytes in a 4-byte region
        let packet = encode_packet(&CommonHeader::new(1, 2, 0), &[id::COOKIE_ACK, 0, 0, 8]).unwrap();
        let outcome = d
            .on_packet(&packet, addr("10.0.0.1:1"), addr("10.0.0.2:2"))
            .unwrap();
        assert_eq!(outcome, Disposition::Discarded(DiscardReason::Malformed));
    }

    #[test]
    fn test_ootb_abort_can_be_disabled() {
        let config = GecoConfig::default_with_overrides(|c| c.endpoint.send_abort_for_ootb = false);
        let mut d = Dispatcher::new(DispatchContext::with_seed(config, 3), MemoryTransport::new());
        let packet =
            encode_packet(&CommonHeader::new(1, 2, 55), &builder::chunk(0x3F, 0, &[]).unwrap())
                .unwrap();
        let outcome = d
            .on_packet(&packet, addr("10.0.0.1:1"), addr("10.0.0.2:2"))
            .unwrap();
        assert_eq!(outcome, Disposition::Discarded(DiscardReason::OutOfTheBlue));
        assert!(d.transport().sent().is_empty());
    }
}
