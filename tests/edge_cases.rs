#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge cases of the dispatch path: verification tag exceptions,
//! out-of-the-blue handling, unrecognized chunks and parameters, and
//! argument checking on the local API.

use geco_dispatch::config::GecoConfig;
use geco_dispatch::core::builder;
use geco_dispatch::core::chunk::{id, ChunkIter, InitFixed, FLAG_T_BIT};
use geco_dispatch::core::packet::{encode_packet, CommonHeader, Packet};
use geco_dispatch::core::param::{self, cause, kind, ParamIter};
use geco_dispatch::protocol::address::AddressTypes;
use geco_dispatch::protocol::validator::Rejection;
use geco_dispatch::transport::memory::MemoryTransport;
use geco_dispatch::{
    Binding, ChannelId, ChannelState, DiscardReason, DispatchContext, Dispatcher, Disposition,
    InstanceId, InstanceSpec, ProtocolError,
};
use std::net::{IpAddr, SocketAddr};

const A_PORT: u16 = 5000;
const B_PORT: u16 = 6000;

fn sock(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn a_addr() -> SocketAddr {
    sock("10.0.0.1:5000")
}

fn b_addr() -> SocketAddr {
    sock("10.0.0.2:6000")
}

fn node(addr: SocketAddr, seed: u64, config: GecoConfig) -> (Dispatcher<MemoryTransport>, InstanceId) {
    let mut dispatcher = Dispatcher::new(
        DispatchContext::with_seed(config, seed),
        MemoryTransport::new(),
    );
    let instance = dispatcher
        .register_instance(InstanceSpec {
            local_port: addr.port(),
            binding: Binding::Addresses(vec![addr.ip()]),
            supported: AddressTypes::IPV4,
            inbound_streams: 10,
            outbound_streams: 10,
            events: None,
        })
        .unwrap();
    (dispatcher, instance)
}

fn packet(src: u16, dst: u16, tag: u32, chunks: &[Vec<u8>]) -> Vec<u8> {
    encode_packet(&CommonHeader::new(src, dst, tag), &chunks.concat()).unwrap()
}

fn init_chunk(tag: u32, params: &[u8]) -> Vec<u8> {
    let fixed = InitFixed {
        init_tag: tag,
        rwnd: 8192,
        outbound_streams: 4,
        inbound_streams: 4,
        initial_tsn: 9,
    };
    builder::init(id::INIT, &fixed, params).unwrap()
}

fn chunk_ids(bytes: &[u8]) -> Vec<u8> {
    ChunkIter::new(Packet::parse(bytes).unwrap().chunks)
        .map(|c| c.unwrap().chunk_id())
        .collect()
}

fn sent(dispatcher: &mut Dispatcher<MemoryTransport>) -> Vec<Vec<u8>> {
    dispatcher
        .transport_mut()
        .take_sent()
        .into_iter()
        .map(|p| p.bytes)
        .collect()
}

fn forward(
    from: &mut Dispatcher<MemoryTransport>,
    to: &mut Dispatcher<MemoryTransport>,
    src: SocketAddr,
    dst: SocketAddr,
) {
    for bytes in sent(from) {
        to.on_packet(&bytes, src, dst).unwrap();
    }
}

/// Two dispatchers with an established association; returns A's and B's channels.
fn established() -> (
    Dispatcher<MemoryTransport>,
    ChannelId,
    Dispatcher<MemoryTransport>,
    ChannelId,
) {
    let (mut a, a_inst) = node(a_addr(), 1, GecoConfig::default());
    let (mut b, _) = node(b_addr(), 2, GecoConfig::default());
    let a_channel = a.connect(a_inst, B_PORT, &[b_addr().ip()], 10, 10).unwrap();

    forward(&mut a, &mut b, a_addr(), b_addr());
    forward(&mut b, &mut a, b_addr(), a_addr());
    forward(&mut a, &mut b, a_addr(), b_addr());
    forward(&mut b, &mut a, b_addr(), a_addr());

    let b_channel = b.channels().iter().next().unwrap().id;
    assert_eq!(a.channel(a_channel).unwrap().state, ChannelState::Connected);
    (a, a_channel, b, b_channel)
}

// ============================================================================
// PACKET SHAPE
// ============================================================================

#[test]
fn test_oversized_packet_rejected() {
    let (mut b, _) = node(b_addr(), 3, GecoConfig::default());
    let big = builder::chunk(id::DATA, 0, &[0u8; 600]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 1, &[big]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::Invalid(Rejection::Length(bytes.len())))
    );
}

#[test]
fn test_larger_mtu_accepts_larger_packets() {
    let config = GecoConfig::default_with_overrides(|c| c.bundling.mtu = 1500);
    let (mut b, _) = node(b_addr(), 4, config);
    let big = builder::chunk(id::DATA, 0, &[0u8; 600]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 1, &[big]);
    // Gets past the validator, then is out of the blue
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Aborted(None)
    );
}

#[test]
fn test_init_must_be_alone() {
    let (mut b, _) = node(b_addr(), 5, GecoConfig::default());
    let bytes = packet(
        A_PORT,
        B_PORT,
        0,
        &[init_chunk(7, &[]), builder::cookie_ack().unwrap()],
    );
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::ExclusiveChunk)
    );
    assert!(sent(&mut b).is_empty());
}

#[test]
fn test_multicast_source_rejected() {
    let (mut b, _) = node(b_addr(), 6, GecoConfig::default());
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &[])]);
    let outcome = b.on_packet(&bytes, sock("224.0.0.5:5000"), b_addr()).unwrap();
    assert!(matches!(
        outcome,
        Disposition::Discarded(DiscardReason::Invalid(Rejection::SourceAddress(_)))
    ));
}

// ============================================================================
// OUT OF THE BLUE
// ============================================================================

#[test]
fn test_ootb_abort_is_silently_dropped() {
    let (mut b, _) = node(b_addr(), 7, GecoConfig::default());
    let bytes = packet(A_PORT, B_PORT, 5, &[builder::abort(false, None).unwrap()]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::OutOfTheBlue)
    );
    assert!(sent(&mut b).is_empty());
}

#[test]
fn test_ootb_cookie_ack_and_stale_cookie_error_dropped() {
    let (mut b, _) = node(b_addr(), 8, GecoConfig::default());
    let ack = packet(A_PORT, B_PORT, 5, &[builder::cookie_ack().unwrap()]);
    assert_eq!(
        b.on_packet(&ack, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::OutOfTheBlue)
    );

    let stale = param::encode_cause(cause::STALE_COOKIE, &[0, 0, 0, 1]).unwrap();
    let error = packet(A_PORT, B_PORT, 5, &[builder::error(&stale).unwrap()]);
    assert_eq!(
        b.on_packet(&error, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::OutOfTheBlue)
    );
    assert!(sent(&mut b).is_empty());
}

#[test]
fn test_ootb_init_with_nonzero_tag_dropped() {
    let (mut b, _) = node(b_addr(), 9, GecoConfig::default());
    let bytes = packet(A_PORT, B_PORT, 0x99, &[init_chunk(7, &[])]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::VerificationTag)
    );
}

#[test]
fn test_ootb_abort_reply_can_be_disabled() {
    let config = GecoConfig::default_with_overrides(|c| c.endpoint.send_abort_for_ootb = false);
    let (mut b, _) = node(b_addr(), 10, config);
    let data = builder::chunk(id::DATA, 0, &[1, 2, 3, 4]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 5, &[data]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::OutOfTheBlue)
    );
    assert!(sent(&mut b).is_empty());
}

// ============================================================================
// PARAMETERS
// ============================================================================

#[test]
fn test_init_with_stopping_parameter_dropped_without_reply() {
    let (mut b, _) = node(b_addr(), 11, GecoConfig::default());
    let mut params = Vec::new();
    param::write_tlv(&mut params, 0x0F00, &[1]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::UnrecognizedParameter)
    );
    assert!(sent(&mut b).is_empty());
}

#[test]
fn test_init_with_reported_parameter_echoes_it_in_init_ack() {
    let (mut b, _) = node(b_addr(), 12, GecoConfig::default());
    let mut params = Vec::new();
    param::write_tlv(&mut params, 0xC0F0, &[0xAB, 0xCD]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );

    let reply = sent(&mut b).pop().unwrap();
    let init_ack = ChunkIter::new(Packet::parse(&reply).unwrap().chunks)
        .next()
        .unwrap()
        .unwrap();
    let report = param::find_param(&init_ack.value[16..], kind::UNRECOGNIZED_PARAMETER).unwrap();
    assert_eq!(report.value, &params[..6]);
}

#[test]
fn test_init_ack_without_cookie_aborts_handshake() {
    let (mut a, a_inst) = node(a_addr(), 13, GecoConfig::default());
    let channel = a.connect(a_inst, B_PORT, &[b_addr().ip()], 10, 10).unwrap();
    sent(&mut a);
    let local_tag = a.channel(channel).unwrap().local_tag;

    let fixed = InitFixed {
        init_tag: 0x7777,
        rwnd: 8192,
        outbound_streams: 4,
        inbound_streams: 4,
        initial_tsn: 1,
    };
    let init_ack = builder::init(id::INIT_ACK, &fixed, &[]).unwrap();
    let bytes = packet(B_PORT, A_PORT, local_tag, &[init_ack]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Aborted(Some(cause::MISSING_MANDATORY_PARAM))
    );
    assert!(a.channel(channel).is_none());

    let abort = sent(&mut a).pop().unwrap();
    assert_eq!(Packet::parse(&abort).unwrap().header.verification_tag, local_tag);
    let chunk = ChunkIter::new(Packet::parse(&abort).unwrap().chunks)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(chunk.chunk_id(), id::ABORT);
    assert_eq!(chunk.header.flags & FLAG_T_BIT, FLAG_T_BIT);
    let missing = ParamIter::new(chunk.value).next().unwrap().unwrap();
    assert_eq!(missing.param_type, cause::MISSING_MANDATORY_PARAM);
}

#[test]
fn test_init_ack_in_wrong_state_dropped() {
    let (mut a, a_channel, _b, _) = established();
    let local_tag = a.channel(a_channel).unwrap().local_tag;
    let fixed = InitFixed {
        init_tag: 0x7777,
        rwnd: 8192,
        outbound_streams: 4,
        inbound_streams: 4,
        initial_tsn: 1,
    };
    let init_ack = builder::init(id::INIT_ACK, &fixed, &[]).unwrap();
    let bytes = packet(B_PORT, A_PORT, local_tag, &[init_ack]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::WrongState)
    );
}

// ============================================================================
// ASSOCIATION TRAFFIC
// ============================================================================

#[test]
fn test_init_with_tag_on_association_is_aborted() {
    let (mut a, _, _b, _) = established();
    let bytes = packet(B_PORT, A_PORT, 0x1234, &[init_chunk(0x4321, &[])]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Aborted(Some(cause::INIT_VER_TAG_NOT_ZERO))
    );
    let reply = sent(&mut a).pop().unwrap();
    assert_eq!(Packet::parse(&reply).unwrap().header.verification_tag, 0x4321);
}

#[test]
fn test_unrecognized_chunk_reported_on_association() {
    let (mut a, a_channel, _b, _) = established();
    let (local_tag, remote_tag) = {
        let ch = a.channel(a_channel).unwrap();
        (ch.local_tag, ch.remote_tag)
    };

    let report_and_stop = builder::chunk(0x40, 0, &[]).unwrap();
    let bytes = packet(B_PORT, A_PORT, local_tag, &[report_and_stop]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Replied
    );
    let reply = sent(&mut a).pop().unwrap();
    assert_eq!(Packet::parse(&reply).unwrap().header.verification_tag, remote_tag);
    assert_eq!(chunk_ids(&reply), vec![id::ERROR]);

    let skip = builder::chunk(0x80 | 0x3F, 0, &[]).unwrap();
    let bytes = packet(B_PORT, A_PORT, local_tag, &[skip]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Processed
    );
    assert!(sent(&mut a).is_empty());
}

#[test]
fn test_wrong_tag_on_association_dropped() {
    let (mut a, _, _b, _) = established();
    let data = builder::chunk(id::DATA, 0, &[0; 8]).unwrap();
    let bytes = packet(B_PORT, A_PORT, 0xDEAD, &[data]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::VerificationTag)
    );
}

#[test]
fn test_shutdown_complete_outside_shutdown_dropped() {
    let (mut a, a_channel, _b, _) = established();
    let local_tag = a.channel(a_channel).unwrap().local_tag;
    let sc = builder::shutdown_complete(false).unwrap();
    let bytes = packet(B_PORT, A_PORT, local_tag, &[sc]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Discarded(DiscardReason::WrongState)
    );
    assert!(a.channel(a_channel).is_some());
}

#[test]
fn test_shutdown_ack_in_cookie_wait_answered_with_t_bit() {
    let (mut a, a_inst) = node(a_addr(), 14, GecoConfig::default());
    a.connect(a_inst, B_PORT, &[b_addr().ip()], 10, 10).unwrap();
    sent(&mut a);

    let bytes = packet(B_PORT, A_PORT, 0x5555, &[builder::shutdown_ack().unwrap()]);
    assert_eq!(
        a.on_packet(&bytes, b_addr(), a_addr()).unwrap(),
        Disposition::Replied
    );
    let reply = sent(&mut a).pop().unwrap();
    assert_eq!(Packet::parse(&reply).unwrap().header.verification_tag, 0x5555);
    assert_eq!(chunk_ids(&reply), vec![id::SHUTDOWN_COMPLETE]);
}

#[test]
fn test_short_writes_are_counted_not_fatal() {
    let (mut b, _) = node(b_addr(), 15, GecoConfig::default());
    b.transport_mut().set_short_writes(true);
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &[])]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );
    assert_eq!(b.metrics().snapshot().send_failures, 1);
}

// ============================================================================
// LOCAL API
// ============================================================================

#[test]
fn test_connect_argument_checks() {
    let (mut a, a_inst) = node(a_addr(), 16, GecoConfig::default());
    assert!(matches!(
        a.connect(a_inst, B_PORT, &[], 10, 10),
        Err(ProtocolError::HandshakeError(_))
    ));
    assert!(matches!(
        a.connect(a_inst, B_PORT, &[b_addr().ip()], 0, 10),
        Err(ProtocolError::HandshakeError(_))
    ));
    let v6: IpAddr = "2001:db8::1".parse().unwrap();
    assert!(matches!(
        a.connect(a_inst, B_PORT, &[v6], 10, 10),
        Err(ProtocolError::AddressFamily(_))
    ));

    a.connect(a_inst, B_PORT, &[b_addr().ip()], 10, 10).unwrap();
    assert!(matches!(
        a.connect(a_inst, B_PORT, &[b_addr().ip()], 10, 10),
        Err(ProtocolError::Registry(_))
    ));
}

#[test]
fn test_multihomed_connect_sends_init_to_every_address() {
    let (mut a, a_inst) = node(a_addr(), 17, GecoConfig::default());
    let remotes: Vec<IpAddr> = vec!["10.0.0.2".parse().unwrap(), "10.0.1.2".parse().unwrap()];
    let channel = a.connect(a_inst, B_PORT, &remotes, 10, 10).unwrap();

    let packets = a.transport_mut().take_sent();
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].destination, sock("10.0.0.2:6000"));
    assert_eq!(packets[1].destination, sock("10.0.1.2:6000"));
    for p in &packets {
        assert_eq!(Packet::parse(&p.bytes).unwrap().header.verification_tag, 0);
        assert_eq!(chunk_ids(&p.bytes), vec![id::INIT]);
    }
    let ch = a.channel(channel).unwrap();
    assert_eq!(ch.state, ChannelState::CookieWait);
    assert_eq!(ch.remote_addresses, remotes);
}

#[test]
fn test_duplicate_instance_bind_rejected() {
    let (mut b, _) = node(b_addr(), 18, GecoConfig::default());
    let again = b.register_instance(InstanceSpec {
        local_port: B_PORT,
        binding: Binding::Any(AddressTypes::IPV4),
        supported: AddressTypes::IPV4,
        inbound_streams: 1,
        outbound_streams: 1,
        events: None,
    });
    assert!(again.is_err());
}

// ============================================================================
// INIT-ACK SIZING
// ============================================================================

fn dual_stack_node(binding: Binding, seed: u64) -> Dispatcher<MemoryTransport> {
    let mut dispatcher = Dispatcher::new(
        DispatchContext::with_seed(GecoConfig::default(), seed),
        MemoryTransport::new(),
    );
    dispatcher
        .register_instance(InstanceSpec {
            local_port: B_PORT,
            binding,
            supported: AddressTypes::IP,
            inbound_streams: 10,
            outbound_streams: 10,
            events: None,
        })
        .unwrap();
    dispatcher
}

fn v6_addresses(count: u16) -> Vec<IpAddr> {
    (1..=count)
        .map(|n| format!("2001:db8::{n:x}").parse().unwrap())
        .collect()
}

fn only_init_ack(reply: &[u8]) -> Vec<u8> {
    let mut chunks = ChunkIter::new(Packet::parse(reply).unwrap().chunks);
    let chunk = chunks.next().unwrap().unwrap();
    assert_eq!(chunk.chunk_id(), id::INIT_ACK);
    assert!(chunks.next().is_none());
    chunk.value.to_vec()
}

#[test]
fn test_large_reported_parameter_is_left_out_of_init_ack() {
    let (mut b, _) = node(b_addr(), 19, GecoConfig::default());
    let mut params = Vec::new();
    param::write_tlv(&mut params, 0xC0F0, &[0x5A; 460]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );

    let reply = sent(&mut b).pop().unwrap();
    assert!(reply.len() <= 556);
    let value = only_init_ack(&reply);
    assert!(param::find_param(&value[16..], kind::STATE_COOKIE).is_some());
    assert!(param::find_param(&value[16..], kind::UNRECOGNIZED_PARAMETER).is_none());
    assert_eq!(b.metrics().snapshot().invariant_violations, 0);
}

#[test]
fn test_reports_that_fit_are_kept_in_order() {
    let (mut b, _) = node(b_addr(), 20, GecoConfig::default());
    let mut params = Vec::new();
    param::write_tlv(&mut params, 0xC0F1, &[1; 8]).unwrap();
    param::write_tlv(&mut params, 0xC0F2, &[2; 420]).unwrap();
    param::write_tlv(&mut params, 0xC0F3, &[3; 8]).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );

    let reply = sent(&mut b).pop().unwrap();
    assert!(reply.len() <= 556);
    let value = only_init_ack(&reply);
    let reported: Vec<u16> = ParamIter::new(&value[16..])
        .map(|p| p.unwrap())
        .filter(|p| p.param_type == kind::UNRECOGNIZED_PARAMETER)
        .map(|p| u16::from_be_bytes([p.value[0], p.value[1]]))
        .collect();
    assert_eq!(reported, vec![0xC0F1, 0xC0F3]);
}

#[test]
fn test_many_peer_addresses_trimmed_to_fit_the_cookie() {
    let mut b = dual_stack_node(Binding::Addresses(vec![b_addr().ip()]), 21);
    let mut params = Vec::new();
    for addr in v6_addresses(26) {
        param::write_address(&mut params, &addr).unwrap();
    }
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(7, &params)]);
    assert!(bytes.len() <= 556);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );

    let reply = sent(&mut b).pop().unwrap();
    assert!(reply.len() <= 556);
    let value = only_init_ack(&reply);
    let cookie = param::find_param(&value[16..], kind::STATE_COOKIE).unwrap();
    let cookie = b.context().cookies().validate(cookie.value).unwrap();
    assert!(cookie.peer_addresses.contains(&a_addr().ip()));
    assert!(cookie.peer_addresses.len() < 27);
    assert_eq!(&cookie.peer_addresses[..2], &v6_addresses(2)[..]);
}

#[test]
fn test_cookie_that_cannot_fit_aborts_with_out_of_resource() {
    let mut local = v6_addresses(25);
    local.push(b_addr().ip());
    let mut b = dual_stack_node(Binding::Addresses(local), 22);
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(0x0A0B, &[])]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Aborted(Some(cause::OUT_OF_RESOURCE))
    );

    let reply = sent(&mut b).pop().unwrap();
    assert_eq!(Packet::parse(&reply).unwrap().header.verification_tag, 0x0A0B);
    let chunk = ChunkIter::new(Packet::parse(&reply).unwrap().chunks)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(chunk.chunk_id(), id::ABORT);
    assert_eq!(chunk.header.flags & FLAG_T_BIT, 0);
    assert_eq!(b.metrics().snapshot().init_acks_sent, 0);
}

// ============================================================================
// ADDRESS TYPES
// ============================================================================

fn assert_unsupported_types_abort(reply: &[u8], peer_tag: u32) {
    assert_eq!(Packet::parse(reply).unwrap().header.verification_tag, peer_tag);
    let chunk = ChunkIter::new(Packet::parse(reply).unwrap().chunks)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(chunk.chunk_id(), id::ABORT);
    assert_eq!(chunk.header.flags & FLAG_T_BIT, 0);
    let reason = ParamIter::new(chunk.value).next().unwrap().unwrap();
    assert_eq!(reason.param_type, cause::PEER_NOT_SUPPORT_ADDR_TYPES);
}

#[test]
fn test_init_advertising_no_common_address_type_is_aborted() {
    let (mut b, _) = node(b_addr(), 23, GecoConfig::default());
    let params = builder::supported_address_types(false, true).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(0x0C0D, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Aborted(Some(cause::PEER_NOT_SUPPORT_ADDR_TYPES))
    );
    assert_unsupported_types_abort(&sent(&mut b).pop().unwrap(), 0x0C0D);
}

#[test]
fn test_init_advertising_a_common_address_type_is_answered() {
    let (mut b, _) = node(b_addr(), 24, GecoConfig::default());
    let params = builder::supported_address_types(true, true).unwrap();
    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(0x0C0E, &params)]);
    assert_eq!(
        b.on_packet(&bytes, a_addr(), b_addr()).unwrap(),
        Disposition::Replied
    );
}

#[test]
fn test_init_from_unserved_family_is_aborted() {
    let mut b = Dispatcher::new(
        DispatchContext::with_seed(GecoConfig::default(), 25),
        MemoryTransport::new(),
    );
    b.register_instance(InstanceSpec {
        local_port: B_PORT,
        binding: Binding::Any(AddressTypes::IP),
        supported: AddressTypes::IPV4,
        inbound_streams: 10,
        outbound_streams: 10,
        events: None,
    })
    .unwrap();

    let bytes = packet(A_PORT, B_PORT, 0, &[init_chunk(0x0E0F, &[])]);
    assert_eq!(
        b.on_packet(&bytes, sock("[2001:db8::1]:5000"), sock("[2001:db8::2]:6000"))
            .unwrap(),
        Disposition::Aborted(Some(cause::PEER_NOT_SUPPORT_ADDR_TYPES))
    );
    let reply = b.transport_mut().take_sent().pop().unwrap();
    assert_eq!(reply.destination, sock("[2001:db8::1]:5000"));
    assert_unsupported_types_abort(&reply.bytes, 0x0E0F);
    assert_eq!(b.channels().len(), 0);
}
