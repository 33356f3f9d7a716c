//! # Core Wire Components
//!
//! Low-level packet handling: common header, chunk and parameter TLVs,
//! checksum, and a datagram codec for framing inbound UDP traffic.
//!
//! ## Components
//! - **Packet**: 12-byte common header plus an opaque chunk chain
//! - **Chunk**: chunk headers, a validating iterator and a parsed chunk enum
//! - **Param**: variable-length parameters, address TLVs and error causes
//! - **Builder**: encoders for the chunks this layer emits
//! - **Checksum**: byte-swapped CRC32-C over the packet with the field zeroed
//! - **Codec**: tokio codec handing whole datagrams to the dispatcher
//!
//! ## Wire Format
//! ```text
//! [SrcPort(2)] [DstPort(2)] [VerificationTag(4)] [Checksum(4)] [Chunk]...
//! Chunk: [Id(1)] [Flags(1)] [Length(2)] [Value(Length-4)] [Pad to 4]
//! ```
//!
//! All multi-byte fields are big-endian except the checksum, which is stored
//! byte-swapped.

pub mod builder;
pub mod checksum;
pub mod chunk;
pub mod codec;
pub mod packet;
pub mod param;
