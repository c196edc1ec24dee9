//! OpenSASE Edge - Tunnel Port Demultiplexer
//!
//! Maps an incoming encapsulated packet to a logical tunnel port, and
//! prepares the outer header fields for packets going out a tunnel port.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     TUNNEL PORT DEMULTIPLEXER                           │
//! │                                                                         │
//! │  ┌────────────────────┐       writer lock       ┌────────────────────┐ │
//! │  │    PortRegistry     │────────────────────────▶│     MatchIndex      │ │
//! │  │ register/deregister │                         │  12 priority        │ │
//! │  │ reconfigure         │◀────────────────────────│  buckets            │ │
//! │  └──────────┬──────────┘       reader lock       └──────────┬──────────┘ │
//! │             │                                               │            │
//! │    by upstream_port                                  by TunnelMatch      │
//! │             │                                               │            │
//! │  ┌──────────▼──────────┐                         ┌──────────▼──────────┐ │
//! │  │      SendPath        │                         │     ReceivePath      │ │
//! │  │ send / build_header  │                         │ receive / wc_init /  │ │
//! │  │                      │                         │ process_ecn          │ │
//! │  └──────────────────────┘                         └──────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Packet parsing into a `FlowKey`, the `NetworkDevice` abstraction that
//! supplies tunnel configuration and builds protocol-specific outer headers,
//! and the `DatapathPortTable` used for kernel offload are all external
//! collaborators (see `SPEC_FULL.md` §1, §6); this crate defines only the
//! trait surfaces it consumes from them, plus in-memory test doubles.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod dptable;
pub mod flow;
pub mod header;
pub mod match_index;
pub mod netdev;
pub mod ratelimit;
pub mod receive;
pub mod registry;
pub mod send;
pub mod tunnel_match;

use thiserror::Error;

pub use flow::FlowKey;
pub use netdev::{NetworkDevice, TunnelConfig};
pub use registry::PortRegistry;
pub use tunnel_match::{TunnelMatch, TunnelPort, UpstreamPort};

/// Tunnel demultiplexer error types.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    /// `register` found an identical `TunnelMatch` already present.
    #[error("attempting to add tunnel port with same config as an existing port")]
    AlreadyRegistered,
}
