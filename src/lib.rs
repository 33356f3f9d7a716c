//! # geco-dispatch
//!
//! Dispatch layer for Geco, an SCTP-style message transport carried over UDP.
//!
//! Inbound datagrams are validated (checksum, ports, sizes), their chunk
//! chains are demultiplexed, and each packet is matched to an association
//! (channel) or a listening endpoint (instance). The verification tag rules
//! and out-of-the-blue rules are applied before any chunk reaches the
//! handshake, which establishes associations with a four-way exchange and an
//! HMAC-authenticated State Cookie. Replies are bundled into as few packets
//! as the path MTU allows.
//!
//! ## Layout
//! - [`core`]: wire formats, checksum, chunk and parameter codecs
//! - [`protocol`]: validator, registries, dispatcher, handshake, bundler
//! - [`transport`]: the outbound transport trait, UDP and in-memory
//! - [`service`]: a tokio UDP endpoint that drives a dispatcher
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```no_run
//! use geco_dispatch::config::GecoConfig;
//! use geco_dispatch::service::Endpoint;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> geco_dispatch::error::Result<()> {
//! let mut endpoint = Endpoint::bind(GecoConfig::default()).await?;
//! endpoint.listen(None)?;
//! let (_stop, stop_rx) = mpsc::channel(1);
//! endpoint.run_with_shutdown(stop_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::GecoConfig;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{DispatchContext, Dispatcher, Disposition, DiscardReason};
pub use protocol::events::{AssociationEvents, AssociationUp, LossReason};
pub use protocol::registry::{Binding, ChannelId, ChannelState, InstanceId, InstanceSpec};
