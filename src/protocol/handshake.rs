//! Association establishment: INIT, INIT-ACK, COOKIE-ECHO and COOKIE-ACK.
//!
//! The responder side keeps no state for an INIT it answers without an
//! existing association; everything travels in the State Cookie. INITs that
//! hit an existing association are resolved with tie-tags: an INIT-ACK is
//! resent with the original or a fresh tag depending on the state, and a peer
//! that brings addresses the association has never seen is refused.

use crate::core::builder;
use crate::core::chunk::{id, InitChunk, InitFixed, UnrecognizedAction, INIT_FIXED_SIZE};
use crate::core::packet::CHUNK_HEADER_SIZE;
use crate::core::param::{self, cause, kind, ParamIter, PARAM_HEADER_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::address::{read_peer_addresses, AddressTypes, MAX_NUM_ADDRESSES};
use crate::protocol::bundler::Region;
use crate::protocol::cookie::StateCookie;
use crate::protocol::dispatcher::{DiscardReason, Dispatcher, Disposition, Flow, PacketMeta, Target};
use crate::protocol::events::LossReason;
use crate::protocol::registry::{Channel, ChannelId, ChannelState, InstanceId};
use crate::transport::Transport;
use std::net::IpAddr;
use tracing::{debug, info, trace};

/// What to do about the unrecognized parameters of an INIT or INIT-ACK
#[derive(Debug, Default)]
struct ParamScan {
    /// Set when a parameter's type says to stop processing
    stop: Option<UnrecognizedAction>,
    /// Unrecognized Parameter TLVs for the peer, one entry per parameter
    report: Vec<Vec<u8>>,
}

impl ParamScan {
    /// Report TLVs that fit in `room` bytes, in order; the rest are dropped.
    fn report_within(&self, room: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut dropped = 0usize;
        for tlv in &self.report {
            if out.len() + tlv.len() <= room {
                out.extend_from_slice(tlv);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, room, "Unrecognized parameter report truncated");
        }
        out
    }
}

fn scan_parameters(params: &[u8]) -> Result<ParamScan> {
    let mut scan = ParamScan::default();
    for raw in ParamIter::new(params) {
        let raw = raw?;
        if param::is_known(raw.param_type) {
            continue;
        }
        let action = UnrecognizedAction::for_param(raw.param_type);
        trace!(param_type = raw.param_type, ?action, "Unrecognized parameter");
        if action.reports() {
            let mut tlv = Vec::with_capacity(raw.wire.len() + PARAM_HEADER_SIZE + 3);
            param::write_tlv(&mut tlv, kind::UNRECOGNIZED_PARAMETER, raw.wire)?;
            scan.report.push(tlv);
        }
        if action.stops() {
            scan.stop = Some(action);
            break;
        }
    }
    Ok(scan)
}

/// Drop peer addresses other than `source`, last first, until the cookie
/// encodes in at most `room` bytes. Returns whether it fits.
fn fit_cookie(cookie: &mut StateCookie, source: IpAddr, room: usize) -> bool {
    while cookie.encoded_len() > room {
        match cookie.peer_addresses.iter().rposition(|addr| *addr != source) {
            Some(at) => {
                cookie.peer_addresses.remove(at);
            }
            None => return false,
        }
    }
    true
}

/// INIT-ACK chunk header plus its fixed fields
const INIT_ACK_OVERHEAD: usize = CHUNK_HEADER_SIZE + INIT_FIXED_SIZE;

fn invariant(msg: &str) -> ProtocolError {
    ProtocolError::InvariantViolation(msg.into())
}

/// Take over the negotiated parameters carried by a cookie and enter ESTABLISHED.
fn adopt_cookie(ch: &mut Channel, cookie: &StateCookie) {
    let local = &cookie.local_init_ack;
    let peer = &cookie.peer_init;
    ch.local_tag = local.init_tag;
    ch.remote_tag = peer.init_tag;
    ch.outbound_streams = local.outbound_streams.min(peer.inbound_streams);
    ch.inbound_streams = local.inbound_streams.min(peer.outbound_streams);
    ch.peer_rwnd = peer.rwnd;
    ch.local_initial_tsn = local.initial_tsn;
    ch.peer_initial_tsn = peer.initial_tsn;
    ch.local_tie_tag = ch.local_tag;
    ch.peer_tie_tag = ch.remote_tag;
    ch.own_init = None;
    ch.state = ChannelState::Connected;
}

impl<T: Transport> Dispatcher<T> {
    /// Answer an INIT with an INIT-ACK carrying a fresh State Cookie, or
    /// refuse it.
    pub(crate) fn process_init_chunk(
        &mut self,
        instance: InstanceId,
        channel: Option<ChannelId>,
        init: &InitChunk<'_>,
        meta: &PacketMeta,
    ) -> Result<Disposition> {
        let peer_init = init.fixed;
        if peer_init.has_invalid_mandatory_fields() {
            debug!(?peer_init, "INIT with a zero tag or stream count");
            return self.send_abort(
                meta.reflect(peer_init.init_tag),
                false,
                Some(cause::INVALID_MANDATORY_PARAM),
                &[],
                None,
            );
        }

        let (supported, max_outbound, max_inbound, bound_addresses) = {
            let inst = self
                .instances
                .get(instance)
                .ok_or_else(|| invariant(constants::ERR_CHANNEL_WITHOUT_INSTANCE))?;
            (
                inst.supported,
                inst.outbound_streams,
                inst.inbound_streams,
                inst.local_addresses(meta.destination.ip()),
            )
        };
        let source = meta.source.ip();
        if !supported.supports(&source) {
            debug!(%source, %supported, "INIT from an address family this instance does not serve");
            return self.send_abort(
                meta.reflect(peer_init.init_tag),
                false,
                Some(cause::PEER_NOT_SUPPORT_ADDR_TYPES),
                &[],
                None,
            );
        }
        let (peer, scan) = match read_peer_addresses(init.params, source, supported)
            .and_then(|peer| Ok((peer, scan_parameters(init.params)?)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "INIT parameters malformed");
                return Ok(Disposition::discard(DiscardReason::Malformed));
            }
        };
        if let Some(action) = scan.stop {
            debug!(?action, "INIT carries a parameter that stops processing");
            return Ok(Disposition::discard(DiscardReason::UnrecognizedParameter));
        }
        if let Some(advertised) = peer.advertised {
            if !advertised.intersects(supported & AddressTypes::IP) {
                debug!(%advertised, %supported, "INIT advertises no address type in common");
                return self.send_abort(
                    meta.reflect(peer_init.init_tag),
                    false,
                    Some(cause::PEER_NOT_SUPPORT_ADDR_TYPES),
                    &[],
                    None,
                );
            }
        }

        let preservative = param::find_param(init.params, kind::COOKIE_PRESERVATIVE)
            .and_then(|p| param::read_u32_value(&p));
        let lifetime_ms = self.ctx.config().cookie.lifetime_ms(preservative);
        let rwnd = self.ctx.config().endpoint.rwnd;

        let (local, local_tie_tag, peer_tie_tag, local_addresses) = match channel {
            None => {
                let tag = self.ctx.random_tag();
                let local = InitFixed {
                    init_tag: tag,
                    rwnd,
                    outbound_streams: max_outbound.min(peer_init.inbound_streams),
                    inbound_streams: max_inbound.min(peer_init.outbound_streams),
                    initial_tsn: tag,
                };
                (local, 0, 0, bound_addresses)
            }
            Some(id) => {
                let ch = self.channel_or_err(id)?;
                let state = ch.state;
                let local_addresses = if ch.local_addresses.is_empty() {
                    bound_addresses
                } else {
                    ch.local_addresses.clone()
                };
                match state {
                    ChannelState::ShutdownAckSent => {
                        debug!(channel = %id, "INIT in SHUTDOWN-ACK-SENT, resending SHUTDOWN-ACK");
                        let ack = builder::shutdown_ack()?;
                        self.bundle_into(Target::Channel(id), Region::Control, &ack, None)?;
                        return Ok(Disposition::Replied);
                    }
                    ChannelState::CookieWait => {
                        if !ch.tie_tags_clear() {
                            return Err(invariant(constants::ERR_TIE_TAGS_SET));
                        }
                        let own = ch
                            .own_init
                            .ok_or_else(|| invariant(constants::ERR_MISSING_OWN_INIT))?;
                        (own, 0, 0, local_addresses)
                    }
                    ChannelState::CookieEchoed => {
                        if !ch.tie_tags_set() {
                            return Err(invariant(constants::ERR_TIE_TAGS_ZERO));
                        }
                        let own = ch
                            .own_init
                            .ok_or_else(|| invariant(constants::ERR_MISSING_OWN_INIT))?;
                        if let Some(refused) =
                            self.refuse_new_addresses(id, &peer.addresses, peer_init.init_tag, meta)?
                        {
                            return Ok(refused);
                        }
                        let local_tie = self.ctx.random_tag();
                        let peer_tie = self.ctx.random_tag();
                        let ch = self.channel_mut_or_err(id)?;
                        ch.local_tie_tag = local_tie;
                        ch.peer_tie_tag = peer_tie;
                        (own, local_tie, peer_tie, local_addresses)
                    }
                    ChannelState::Connected
                    | ChannelState::ShutdownPending
                    | ChannelState::ShutdownReceived
                    | ChannelState::ShutdownSent => {
                        if !ch.tie_tags_set() {
                            return Err(invariant(constants::ERR_TIE_TAGS_ZERO));
                        }
                        let (outbound, inbound) = (ch.outbound_streams, ch.inbound_streams);
                        let (local_tie, peer_tie) = (ch.local_tie_tag, ch.peer_tie_tag);
                        if let Some(refused) =
                            self.refuse_new_addresses(id, &peer.addresses, peer_init.init_tag, meta)?
                        {
                            return Ok(refused);
                        }
                        let tag = self.ctx.random_tag();
                        let local = InitFixed {
                            init_tag: tag,
                            rwnd,
                            outbound_streams: outbound,
                            inbound_streams: inbound,
                            initial_tsn: tag,
                        };
                        (local, local_tie, peer_tie, local_addresses)
                    }
                }
            }
        };

        let local_addresses: Vec<IpAddr> = local_addresses
            .into_iter()
            .filter(|a| peer.supported.supports(a))
            .collect();
        let mut cookie = StateCookie {
            local_init_ack: local,
            peer_init,
            local_port: meta.header.dst_port,
            peer_port: meta.header.src_port,
            local_tie_tag,
            peer_tie_tag,
            created_at_ms: self.ctx.now_ms()?,
            lifetime_ms,
            local_addresses,
            peer_addresses: peer.addresses,
        };
        // The INIT-ACK travels alone, so it has the whole ceiling to itself
        let ceiling = self.ctx.config().bundling.chunk_ceiling();
        let room = ceiling.saturating_sub(INIT_ACK_OVERHEAD + PARAM_HEADER_SIZE);
        if !fit_cookie(&mut cookie, source, room) {
            debug!(cookie_len = cookie.encoded_len(), ceiling, "State Cookie cannot fit an INIT-ACK");
            return self.send_abort(
                meta.reflect(peer_init.init_tag),
                false,
                Some(cause::OUT_OF_RESOURCE),
                &[],
                None,
            );
        }
        let cookie_bytes = self.ctx.cookies().build(&cookie)?;

        let mut params = Vec::with_capacity(ceiling);
        param::write_tlv(&mut params, kind::STATE_COOKIE, &cookie_bytes)?;
        if cookie.local_addresses.len() > 1 {
            let mut addresses = Vec::new();
            for addr in &cookie.local_addresses {
                param::write_address(&mut addresses, addr)?;
            }
            if INIT_ACK_OVERHEAD + params.len() + addresses.len() <= ceiling {
                params.extend_from_slice(&addresses);
            } else {
                debug!("Local address list left out of the INIT-ACK");
            }
        }
        let report = scan.report_within(ceiling.saturating_sub(INIT_ACK_OVERHEAD + params.len()));
        params.extend_from_slice(&report);
        let init_ack = builder::init(id::INIT_ACK, &local, &params)?;

        match channel {
            Some(id) => self.bundle_into(
                Target::Channel(id),
                Region::Control,
                &init_ack,
                Some(peer_init.init_tag),
            )?,
            None => self.reply_ootb(meta.reflect(peer_init.init_tag), &init_ack)?,
        }
        self.ctx.metrics().init_ack_sent();
        debug!(
            tag = local.init_tag,
            outbound = local.outbound_streams,
            inbound = local.inbound_streams,
            local_tie_tag,
            peer_tie_tag,
            "INIT-ACK sent"
        );
        Ok(Disposition::Replied)
    }

    /// Refuse an INIT that lists addresses the association has never seen.
    fn refuse_new_addresses(
        &mut self,
        id: ChannelId,
        peer_addresses: &[IpAddr],
        peer_tag: u32,
        meta: &PacketMeta,
    ) -> Result<Option<Disposition>> {
        let ch = self.channel_or_err(id)?;
        let unseen: Vec<IpAddr> = peer_addresses
            .iter()
            .filter(|addr| !ch.has_remote_address(addr))
            .copied()
            .collect();
        if unseen.is_empty() {
            return Ok(None);
        }
        info!(channel = %id, ?unseen, "Peer restart with new addresses refused");
        // ABORT header plus the cause header leave this much for addresses
        let room = self
            .ctx
            .config()
            .bundling
            .chunk_ceiling()
            .saturating_sub(CHUNK_HEADER_SIZE + PARAM_HEADER_SIZE);
        let mut info = Vec::with_capacity(room);
        for addr in &unseen {
            if info.len() + param::address_param_len(addr) > room {
                break;
            }
            param::write_address(&mut info, addr)?;
        }
        self.send_abort(
            meta.reflect(peer_tag),
            false,
            Some(cause::RESTART_WITH_NEW_ADDRESSES),
            &info,
            None,
        )?;
        Ok(Some(Disposition::RestartRejected))
    }

    /// Initiator side: take the peer's INIT-ACK, echo its cookie and move to
    /// COOKIE-ECHOED.
    pub(crate) fn process_init_ack_chunk(
        &mut self,
        id: ChannelId,
        init_ack: &InitChunk<'_>,
        meta: &PacketMeta,
    ) -> Result<Disposition> {
        let peer_init = init_ack.fixed;
        // Our own tag, so T is set
        let abort_to = meta.reflect(meta.header.verification_tag);
        if peer_init.has_invalid_mandatory_fields() {
            let outcome =
                self.send_abort(abort_to, true, Some(cause::INVALID_MANDATORY_PARAM), &[], None)?;
            self.delete_channel(id, LossReason::HandshakeFailed)?;
            return Ok(outcome);
        }

        let (instance, own) = {
            let ch = self.channel_or_err(id)?;
            let own = ch
                .own_init
                .ok_or_else(|| invariant(constants::ERR_MISSING_OWN_INIT))?;
            (ch.instance, own)
        };
        let supported = self
            .instances
            .get(instance)
            .map(|inst| inst.supported)
            .ok_or_else(|| invariant(constants::ERR_CHANNEL_WITHOUT_INSTANCE))?;
        let source = meta.source.ip();
        let (peer, scan) = match read_peer_addresses(init_ack.params, source, supported)
            .and_then(|peer| Ok((peer, scan_parameters(init_ack.params)?)))
        {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "INIT-ACK parameters malformed");
                return Ok(Disposition::discard(DiscardReason::Malformed));
            }
        };
        if peer.addresses.is_empty() {
            let outcome = self.send_abort(
                abort_to,
                true,
                Some(cause::PEER_NOT_SUPPORT_ADDR_TYPES),
                &[],
                None,
            )?;
            self.delete_channel(id, LossReason::HandshakeFailed)?;
            return Ok(outcome);
        }
        if let Some(action) = scan.stop {
            debug!(?action, "INIT-ACK carries a parameter that stops processing");
            self.delete_channel(id, LossReason::HandshakeFailed)?;
            return Ok(Disposition::discard(DiscardReason::UnrecognizedParameter));
        }
        let Some(cookie) = param::find_param(init_ack.params, kind::STATE_COOKIE) else {
            let missing = builder::missing_params_info(&[kind::STATE_COOKIE]);
            let outcome = self.send_abort(
                abort_to,
                true,
                Some(cause::MISSING_MANDATORY_PARAM),
                &missing,
                None,
            )?;
            self.delete_channel(id, LossReason::HandshakeFailed)?;
            return Ok(outcome);
        };
        let cookie_echo = builder::cookie_echo(cookie.value)?;

        let ch = self.channel_mut_or_err(id)?;
        ch.remote_tag = peer_init.init_tag;
        ch.peer_rwnd = peer_init.rwnd;
        ch.peer_initial_tsn = peer_init.initial_tsn;
        ch.outbound_streams = own.outbound_streams.min(peer_init.inbound_streams);
        ch.inbound_streams = own.inbound_streams.min(peer_init.outbound_streams);
        ch.primary_path = peer
            .addresses
            .iter()
            .position(|addr| *addr == source)
            .unwrap_or(0);
        ch.remote_addresses = peer.addresses;
        ch.peer_supported = peer.supported;
        ch.pending_dns |= peer.host_name;
        ch.local_tie_tag = ch.local_tag;
        ch.peer_tie_tag = peer_init.init_tag;
        ch.state = ChannelState::CookieEchoed;
        let remote_tag = ch.remote_tag;

        self.bundle_into(Target::Channel(id), Region::Control, &cookie_echo, None)?;
        let ceiling = self.ctx.config().bundling.chunk_ceiling();
        let report = scan.report_within(ceiling.saturating_sub(CHUNK_HEADER_SIZE));
        if !report.is_empty() {
            let error = builder::error(&report)?;
            self.bundle_into(Target::Channel(id), Region::Control, &error, None)?;
        }
        info!(channel = %id, remote_tag, "COOKIE-ECHO sent, entering COOKIE-ECHOED");
        Ok(Disposition::Processed)
    }

    /// Authenticate an echoed cookie and establish (or confirm) the association.
    pub(crate) fn process_cookie_echo_chunk(
        &mut self,
        instance: Option<InstanceId>,
        channel: Option<ChannelId>,
        bytes: &[u8],
        meta: &PacketMeta,
    ) -> Result<Flow> {
        let cookie = match self.ctx.cookies().validate(bytes) {
            Ok(cookie) => cookie,
            Err(e) => {
                self.ctx.metrics().cookie_rejected();
                debug!(error = %e, "COOKIE-ECHO rejected");
                return Ok(Flow::Stop(Disposition::discard(DiscardReason::InvalidCookie)));
            }
        };
        if cookie.local_init_ack.init_tag != meta.header.verification_tag
            || cookie.local_port != meta.header.dst_port
            || cookie.peer_port != meta.header.src_port
        {
            self.ctx.metrics().cookie_rejected();
            debug!("COOKIE-ECHO does not match the packet it arrived in");
            return Ok(Flow::Stop(Disposition::discard(DiscardReason::InvalidCookie)));
        }

        let local_tag = cookie.local_init_ack.init_tag;
        let peer_tag = cookie.peer_init.init_tag;
        if let Some(stale_ms) = cookie.staleness(self.ctx.now_ms()?) {
            let known = channel
                .and_then(|id| self.channels.get(id))
                .is_some_and(|ch| ch.local_tag == local_tag && ch.remote_tag == peer_tag);
            if !known {
                self.ctx.metrics().cookie_rejected();
                debug!(stale_ms, "Stale cookie");
                let staleness_us = stale_ms.saturating_mul(1000).to_be_bytes();
                let causes = param::encode_cause(cause::STALE_COOKIE, &staleness_us)?;
                let error = builder::error(&causes)?;
                self.reply_ootb(meta.reflect(peer_tag), &error)?;
                return Ok(Flow::Stop(Disposition::Replied));
            }
        }
        self.ctx.metrics().cookie_accepted();

        let Some(id) = channel else {
            let Some(instance) = instance else {
                return Ok(Flow::Stop(Disposition::discard(DiscardReason::OutOfTheBlue)));
            };
            let id = self.establish_from_cookie(instance, &cookie, meta)?;
            return Ok(Flow::Established(id));
        };

        let ch = self.channel_mut_or_err(id)?;
        let previous = ch.state;
        if ch.local_tag == local_tag && ch.remote_tag != peer_tag {
            // Collision: the peer's INIT crossed ours, its tag wins
            adopt_cookie(ch, &cookie);
            self.bundle_into(Target::Channel(id), Region::Control, &builder::cookie_ack()?, None)?;
            if previous == ChannelState::Connected {
                info!(channel = %id, remote_tag = peer_tag, "Peer restarted");
                self.notify_restart(id)?;
            } else {
                info!(channel = %id, remote_tag = peer_tag, "Association established after collision");
                self.ctx.metrics().association_established();
                self.notify_up(id)?;
            }
            Ok(Flow::Continue)
        } else if ch.local_tag == local_tag && ch.remote_tag == peer_tag {
            if matches!(previous, ChannelState::CookieWait | ChannelState::CookieEchoed) {
                ch.state = ChannelState::Connected;
                ch.own_init = None;
                self.ctx.metrics().association_established();
                info!(channel = %id, "Association established");
                self.notify_up(id)?;
            }
            self.bundle_into(Target::Channel(id), Region::Control, &builder::cookie_ack()?, None)?;
            Ok(Flow::Continue)
        } else {
            debug!(channel = %id, state = %previous, "COOKIE-ECHO tags match neither side, discarded");
            Ok(Flow::Stop(Disposition::discard(DiscardReason::VerificationTag)))
        }
    }

    /// Create an ESTABLISHED association from a validated cookie and answer
    /// with COOKIE-ACK.
    fn establish_from_cookie(
        &mut self,
        instance: InstanceId,
        cookie: &StateCookie,
        meta: &PacketMeta,
    ) -> Result<ChannelId> {
        let ceiling = self.ctx.config().bundling.chunk_ceiling();
        let id = self
            .channels
            .insert(instance, cookie.local_port, cookie.peer_port, ceiling);
        let source = meta.source.ip();

        let ch = self.channel_mut_or_err(id)?;
        adopt_cookie(ch, cookie);
        ch.local_addresses = cookie.local_addresses.clone();
        ch.remote_addresses = cookie.peer_addresses.clone();
        if !ch.has_remote_address(&source) && ch.remote_addresses.len() < MAX_NUM_ADDRESSES {
            ch.remote_addresses.push(source);
        }
        ch.peer_supported = ch
            .remote_addresses
            .iter()
            .fold(AddressTypes::NONE, |types, addr| types | AddressTypes::of(addr));
        ch.primary_path = ch
            .remote_addresses
            .iter()
            .position(|addr| *addr == source)
            .unwrap_or(0);
        ch.last_source = Some(source);
        ch.bundle.lock();

        self.bundle_into(Target::Channel(id), Region::Control, &builder::cookie_ack()?, None)?;
        self.ctx.metrics().association_established();
        info!(
            channel = %id,
            remote_port = cookie.peer_port,
            local_tag = cookie.local_init_ack.init_tag,
            remote_tag = cookie.peer_init.init_tag,
            "Association established"
        );
        self.notify_up(id)?;
        Ok(id)
    }

    /// COOKIE-ACK completes the handshake for the initiator.
    pub(crate) fn process_cookie_ack_chunk(&mut self, id: ChannelId) -> Result<()> {
        let ch = self.channel_mut_or_err(id)?;
        if ch.state != ChannelState::CookieEchoed {
            trace!(channel = %id, state = %ch.state, "COOKIE-ACK ignored");
            return Ok(());
        }
        ch.state = ChannelState::Connected;
        ch.own_init = None;
        self.ctx.metrics().association_established();
        info!(channel = %id, "Association established");
        self.notify_up(id)
    }
}
