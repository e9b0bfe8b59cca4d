//! rtnet — deterministic, static-memory IPv6 network stack for embedded
//! real-time targets.
//!
//! The stack offers IPv6 datagram transport (UDP), a reduced
//! connection-oriented transport (TCP-Lite), neighbor discovery over
//! ICMPv6, a routing table with longest-prefix-match lookup, an mDNS
//! service-discovery façade, and a periodic maintenance sweep.  Every
//! table is a fixed-size array, every loop is bounded, and nothing ever
//! touches a heap — worst-case execution time is a design constraint,
//! not an afterthought.
//!
//! # Architecture
//!
//! * [`stack::Stack`] is the explicitly constructed context (no global
//!   state): construct it in a `static`, [`init`](stack::Stack::init)
//!   it, and call operations on it from thread context while the RX
//!   interrupt feeds [`process_rx`](stack::Stack::process_rx).
//! * [`platform::Platform`] is the integration seam: critical sections,
//!   the millisecond clock, and the hardware transmit hook.
//! * Buffer and connection references are small index handles that are
//!   re-validated on every use — never raw pointers.
//!
//! # Example
//!
//! ```ignore
//! use rtnet::{Stack, Platform, Ipv6Addr, MacAddr, QosClass};
//!
//! struct Board;
//! impl Platform for Board { /* BSP hooks */ }
//!
//! static NET: Stack<Board> = Stack::new();
//!
//! fn main_task() {
//!     NET.init(&Ipv6Addr::from_bytes(LOCAL_IP), &MacAddr(LOCAL_MAC)).unwrap();
//!     NET.udp_send(&peer, 4000, 0, b"hello", QosClass::Normal).unwrap();
//! }
//!
//! // every ~100 ms:
//! fn tick() { NET.periodic_task(); }
//! ```

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod icmpv6;
pub mod mdns;
pub mod neighbor;
pub mod platform;
pub mod pool;
pub mod route;
pub mod stack;
pub mod tcp;
pub mod types;
pub mod udp;
pub mod wire;

pub use platform::Platform;
pub use stack::Stack;
pub use types::{Ipv6Addr, MacAddr, NetError, QosClass, Statistics, TcpHandle};
pub use udp::UdpHandler;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod neighbor_tests;
#[cfg(test)]
mod route_tests;
