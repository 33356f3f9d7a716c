//! # Service Layer
//!
//! Async drivers that own a dispatcher and feed it from the network.

pub mod endpoint;

pub use endpoint::Endpoint;
