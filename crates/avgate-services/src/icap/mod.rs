//! ICAP (RFC 3507) REQMOD client with Preview.

mod client;
mod verdict;

pub use client::{IcapClient, IcapError};
pub use verdict::IcapVerdict;
