use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use geco_dispatch::config::GecoConfig;
use geco_dispatch::core::chunk::InitFixed;
use geco_dispatch::protocol::address::AddressTypes;
use geco_dispatch::protocol::cookie::{CookieCodec, SecretKey, StateCookie};
use geco_dispatch::transport::memory::MemoryTransport;
use geco_dispatch::{Binding, DispatchContext, Dispatcher, InstanceId, InstanceSpec};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const A: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000);
const B: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6000);

#[allow(clippy::unwrap_used)]
fn node(addr: SocketAddr, seed: u64) -> (Dispatcher<MemoryTransport>, InstanceId) {
    let ctx = DispatchContext::with_seed(GecoConfig::default(), seed);
    let mut dispatcher = Dispatcher::new(ctx, MemoryTransport::new());
    let instance = dispatcher
        .register_instance(InstanceSpec {
            local_port: addr.port(),
            binding: Binding::Addresses(vec![addr.ip()]),
            supported: AddressTypes::IPV4,
            inbound_streams: 8,
            outbound_streams: 8,
            events: None,
        })
        .unwrap();
    (dispatcher, instance)
}

/// Drive INIT, INIT-ACK, COOKIE-ECHO and COOKIE-ACK between two fresh nodes.
#[allow(clippy::unwrap_used)]
fn handshake(
    (mut a, a_instance): (Dispatcher<MemoryTransport>, InstanceId),
    (mut b, _): (Dispatcher<MemoryTransport>, InstanceId),
) {
    a.connect(a_instance, B.port(), &[B.ip()], 4, 4).unwrap();
    for _ in 0..2 {
        for packet in a.transport_mut().take_sent() {
            b.on_packet(&packet.bytes, A, B).unwrap();
        }
        for packet in b.transport_mut().take_sent() {
            a.on_packet(&packet.bytes, B, A).unwrap();
        }
    }
}

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("four_way_handshake", |b| {
        b.iter_batched(
            || (node(A, 1), node(B, 2)),
            |(a, b)| handshake(a, b),
            BatchSize::SmallInput,
        )
    });
}

#[allow(clippy::unwrap_used)]
fn bench_cookie(c: &mut Criterion) {
    let codec = CookieCodec::new(SecretKey::generate(&mut StdRng::seed_from_u64(3)));
    let cookie = StateCookie {
        local_init_ack: InitFixed {
            init_tag: 0x1111_2222,
            rwnd: 65535,
            outbound_streams: 8,
            inbound_streams: 8,
            initial_tsn: 0x1111_2222,
        },
        peer_init: InitFixed {
            init_tag: 0x3333_4444,
            rwnd: 65535,
            outbound_streams: 4,
            inbound_streams: 4,
            initial_tsn: 1,
        },
        local_port: 6000,
        peer_port: 5000,
        lifetime_ms: 10_000,
        local_addresses: vec![B.ip()],
        peer_addresses: vec![A.ip()],
        ..StateCookie::default()
    };
    let bytes = codec.build(&cookie).unwrap();

    let mut group = c.benchmark_group("state_cookie");
    group.bench_function("build", |b| b.iter(|| codec.build(&cookie).unwrap()));
    group.bench_function("validate", |b| b.iter(|| codec.validate(&bytes).unwrap()));
    group.finish();
}

criterion_group!(benches, bench_handshake, bench_cookie);
criterion_main!(benches);
