//! # Error Types
//!
//! Error handling for the Geco dispatch layer.
//!
//! Most bad input never surfaces here: malformed or illegal inbound traffic is
//! silently discarded by the dispatcher and only shows up in diagnostics. The
//! variants below cover the paths that must be reported to the caller.
//!
//! ## Error Categories
//! - **I/O Errors**: socket and file system failures
//! - **Wire Errors**: truncated headers, inconsistent chunk or parameter lengths
//! - **Cookie Errors**: State Cookies that fail authentication or are inconsistent
//! - **Registry Errors**: duplicate binds, unknown instances or channels
//! - **Invariant Violations**: internal consistency failures that untrusted input
//!   must never be able to trigger
//!
//! ## Example Usage
//! ```rust
//! use geco_dispatch::error::{ProtocolError, Result};
//! use geco_dispatch::core::packet::CommonHeader;
//! use tracing::{error, info};
//!
//! fn peek_tag(bytes: &[u8]) -> Result<u32> {
//!     let header = CommonHeader::decode(bytes)?;
//!     Ok(header.verification_tag)
//! }
//!
//! match peek_tag(&[0u8; 4]) {
//!     Ok(tag) => info!(tag, "decoded"),
//!     Err(e) => error!(error=%e, "could not decode header"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire format errors
    pub const ERR_TRUNCATED_HEADER: &str = "Common header truncated";
    pub const ERR_TRUNCATED_CHUNK: &str = "Chunk header truncated";
    pub const ERR_CHUNK_LENGTH: &str = "Chunk length inconsistent with enclosing packet";
    pub const ERR_PARAM_LENGTH: &str = "Parameter length inconsistent with enclosing chunk";
    pub const ERR_INIT_TOO_SHORT: &str = "INIT chunk shorter than its fixed fields";
    pub const ERR_ADDRESS_PARAM: &str = "Address parameter has the wrong length";

    /// Cookie errors
    pub const ERR_COOKIE_TOO_SHORT: &str = "State Cookie shorter than its fixed fields";
    pub const ERR_COOKIE_HMAC: &str = "State Cookie HMAC mismatch";
    pub const ERR_COOKIE_ADDRESSES: &str = "State Cookie address list disagrees with its counts";

    /// Registry errors
    pub const ERR_DUPLICATE_BIND: &str = "An instance is already bound to this transport address";
    pub const ERR_UNKNOWN_INSTANCE: &str = "Instance not found";
    pub const ERR_UNKNOWN_CHANNEL: &str = "Channel not found";
    pub const ERR_INSTANCE_IN_USE: &str = "Instance still has live channels";

    /// Invariant violations
    pub const ERR_CHANNEL_WITHOUT_INSTANCE: &str = "Channel exists but its instance is gone";
    pub const ERR_TIE_TAGS_ZERO: &str = "Tie-tags are zero where they must be set";
    pub const ERR_TIE_TAGS_SET: &str = "Tie-tags are set where they must be zero";
    pub const ERR_MISSING_OWN_INIT: &str = "Channel in COOKIE-WAIT has no record of its own INIT";
    pub const ERR_MISSING_INIT_TAG: &str = "Outgoing INIT-ACK has no peer initiate tag to stamp";

    /// Sending errors
    pub const ERR_DEST_INDEX: &str = "Destination index outside the channel's address list";
    pub const ERR_NO_DESTINATION: &str = "Channel has no destination address";
    pub const ERR_CHUNK_TOO_LARGE: &str = "Chunk cannot fit in a single packet";

    /// Handshake errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_NO_REMOTE_ADDRESS: &str = "Association needs at least one remote address";
    pub const ERR_RANDOM_SEED: &str = "Failed to seed the random number generator";
}

/// Primary error type for all dispatch operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Invalid common header: {0}")]
    InvalidHeader(String),

    #[error("Malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("Malformed parameter: {0}")]
    MalformedParameter(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid State Cookie: {0}")]
    InvalidCookie(String),

    #[error("Address family error: {0}")]
    AddressFamily(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
