#![no_main]

use geco_dispatch::config::GecoConfig;
use geco_dispatch::core::checksum;
use geco_dispatch::protocol::address::AddressTypes;
use geco_dispatch::transport::memory::MemoryTransport;
use geco_dispatch::{Binding, DispatchContext, Dispatcher, InstanceSpec, ProtocolError};
use libfuzzer_sys::fuzz_target;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fuzz_target!(|data: &[u8]| {
    let ctx = DispatchContext::with_seed(GecoConfig::default(), 0);
    let mut dispatcher = Dispatcher::new(ctx, MemoryTransport::new());
    if dispatcher
        .register_instance(InstanceSpec {
            local_port: 6000,
            binding: Binding::Any(AddressTypes::IPV4),
            supported: AddressTypes::IPV4,
            inbound_streams: 8,
            outbound_streams: 8,
            events: None,
        })
        .is_err()
    {
        return;
    }

    // Fix up the checksum half the time so the chunk handlers get exercised
    let mut packet = data.to_vec();
    if packet.first().is_some_and(|b| b & 1 == 1) {
        let _ = checksum::set_checksum(&mut packet);
    }

    let source = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000);
    let destination = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6000);
    let outcome = dispatcher.on_packet(&packet, source, destination);
    assert!(!matches!(outcome, Err(ProtocolError::InvariantViolation(_))));

    for sent in dispatcher.transport().sent() {
        assert!(checksum::validate_checksum(&sent.bytes));
    }
});
