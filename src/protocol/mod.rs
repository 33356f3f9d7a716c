//! # Dispatch Layer
//!
//! Everything between a validated datagram and the association state machine.
//!
//! ## Components
//! - **Validator**: structural and checksum checks on inbound packets
//! - **Classifier**: one pass over the chunk chain, recording which types occur
//! - **Registry**: listening instances and associations (channels)
//! - **Dispatcher**: verification tags, out-of-the-blue handling, chunk routing
//! - **Handshake**: INIT, INIT-ACK, COOKIE-ECHO and COOKIE-ACK processing
//! - **Cookie**: authenticated State Cookies
//! - **Bundler / Sender**: chunk bundling and packet emission

pub mod address;
pub mod bundler;
pub mod classifier;
pub mod cookie;
pub mod dispatcher;
pub mod events;
pub mod handshake;
pub mod registry;
pub mod sender;
pub mod validator;
