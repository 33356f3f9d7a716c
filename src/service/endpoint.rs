//! UDP endpoint driving a [`Dispatcher`] from a tokio task.
//!
//! Every datagram on the socket is one Geco packet. The loop owns the
//! dispatcher, so packet processing is strictly sequential; a timer sweeps
//! deleted channels, and an mpsc channel asks the loop to stop.

use crate::config::GecoConfig;
use crate::core::codec::GecoCodec;
use crate::error::{ProtocolError, Result};
use crate::protocol::address::canonical;
use crate::protocol::dispatcher::{DispatchContext, Dispatcher};
use crate::protocol::events::AssociationEvents;
use crate::protocol::registry::{Binding, InstanceId, InstanceSpec};
use crate::transport::udp::UdpTransport;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::udp::UdpFramed;
use tracing::{debug, error, info, instrument, warn};

pub struct Endpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    dispatcher: Dispatcher<UdpTransport>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Validate the configuration, seed a context and bind the UDP socket.
    #[instrument(skip(config), fields(bind = %config.endpoint.bind_address))]
    pub async fn bind(config: GecoConfig) -> Result<Self> {
        config.validate_strict()?;
        let addr: SocketAddr = config.endpoint.bind_address.parse().map_err(|e| {
            ProtocolError::ConfigError(format!(
                "Invalid bind address {}: {e}",
                config.endpoint.bind_address
            ))
        })?;
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, DispatchContext::new(config)?)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket, ctx: DispatchContext) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let dispatcher = Dispatcher::new(ctx, UdpTransport::new(socket.clone()));
        info!(%local_addr, "Geco endpoint bound");
        Ok(Self {
            socket,
            local_addr,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Dispatcher<UdpTransport> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<UdpTransport> {
        &mut self.dispatcher
    }

    /// Register an instance on the bound address with the configured stream
    /// limits and address families.
    pub fn listen(&mut self, events: Option<Arc<dyn AssociationEvents>>) -> Result<InstanceId> {
        let endpoint = &self.dispatcher.context().config().endpoint;
        let spec = InstanceSpec {
            local_port: self.local_addr.port(),
            binding: Binding::Addresses(vec![canonical(self.local_addr.ip())]),
            supported: endpoint.address_types(),
            inbound_streams: endpoint.inbound_streams,
            outbound_streams: endpoint.outbound_streams,
            events,
        };
        self.dispatcher.register_instance(spec)
    }

    /// Receive and dispatch until `shutdown_rx` fires or its sender is
    /// dropped, then hand the endpoint back for inspection.
    #[instrument(skip(self, shutdown_rx), fields(local = %self.local_addr))]
    pub async fn run_with_shutdown(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<Self> {
        let mut framed = UdpFramed::new(self.socket.clone(), GecoCodec::new());
        let sweep_interval = self.dispatcher.context().config().endpoint.sweep_interval;
        let mut sweeps = IntervalStream::new(tokio::time::interval(sweep_interval));
        let destination = self.local_addr;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down endpoint");
                    self.dispatcher.metrics().log_metrics();
                    return Ok(self);
                }

                Some(_) = sweeps.next() => {
                    let swept = self.dispatcher.sweep();
                    if swept > 0 {
                        debug!(swept, "Swept deleted channels");
                    }
                }

                received = framed.next() => {
                    match received {
                        Some(Ok((bytes, source))) => {
                            let source = SocketAddr::new(canonical(source.ip()), source.port());
                            if let Err(e) = self.dispatcher.on_packet(&bytes, source, destination) {
                                // Already logged by the dispatcher; keep serving
                                debug!(%source, error = %e, "Packet dropped");
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "Receive failed"),
                        None => {
                            error!("Socket stream ended");
                            return Err(ProtocolError::TransportError("UDP socket closed".into()));
                        }
                    }
                }
            }
        }
    }
}
