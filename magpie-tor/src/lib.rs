//! Magpie Tor Layer
//!
//! Tor-based networking for the reconnaissance core:
//! - Egress pool of SOCKS5h proxy ports with round-robin and health stats
//! - Control-port client for circuit rotation and exit introspection
//! - Proxy-aware HTTP client construction and failure classification
//! - Retry combinator for transient network errors

pub mod client;
pub mod controller;
pub mod pool;
pub mod retry;

pub use client::*;
pub use controller::*;
pub use pool::*;
pub use retry::*;
