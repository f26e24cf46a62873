//! Avgate Services Library
//!
//! This crate provides the clients for the two external services the gate
//! talks to: the ICAP scanner (REQMOD with Preview) and the backend
//! application the clean uploads are forwarded to.

pub mod forward;
pub mod icap;

// Re-export commonly used types
pub use forward::{BackendForwarder, ForwardError, ForwardRequest, ForwardedContext};
pub use icap::{IcapClient, IcapError, IcapVerdict};
