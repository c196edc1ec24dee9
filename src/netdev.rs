//! Network device collaborator
//!
//! The real network-device abstraction (VXLAN/GRE/Geneve framing, kernel
//! offload, checksum helpers) lives in the enclosing switch and is out of
//! scope here (see `SPEC_FULL.md` §1). This module defines the trait surface
//! this crate consumes from it, plus a small in-memory test double used by
//! the unit tests and the demonstration binary.

use std::fmt;

use crate::flow::{FlowKey, TunnelIp};
use crate::header::OuterHeaderBuf;

/// Tunnel configuration as read from a network device, mirroring
/// `struct netdev_tunnel_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TunnelConfig {
    pub in_key: u64,
    pub in_key_present: bool,
    pub in_key_flow: bool,
    pub out_key: u64,
    pub out_key_present: bool,
    pub out_key_flow: bool,
    pub ipv6_src: TunnelIp,
    pub ipv6_dst: TunnelIp,
    pub ip_src_flow: bool,
    pub ip_dst_flow: bool,
    pub ttl: u8,
    pub ttl_inherit: bool,
    pub tos: u8,
    pub tos_inherit: bool,
    pub dont_fragment: bool,
    pub csum: bool,
    pub ipsec: bool,
    pub dst_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            in_key: 0,
            in_key_present: false,
            in_key_flow: false,
            out_key: 0,
            out_key_present: false,
            out_key_flow: false,
            ipv6_src: TunnelIp::Unset,
            ipv6_dst: TunnelIp::Unset,
            ip_src_flow: false,
            ip_dst_flow: false,
            ttl: 64,
            ttl_inherit: false,
            tos: 0,
            tos_inherit: false,
            dont_fragment: true,
            csum: false,
            ipsec: false,
            dst_port: 4789,
        }
    }
}

impl TunnelConfig {
    /// True if the in/out key configuration differs, worth calling out in
    /// diagnostics (mirrors the asymmetry check in `tnl_port_fmt`).
    pub fn asymmetric_keys(&self) -> bool {
        self.out_key != self.in_key
            || self.out_key_present != self.in_key_present
            || self.out_key_flow != self.in_key_flow
    }
}

/// The collaborator interface this crate needs from a network device.
///
/// `ref`/`close` from the original are expressed idiomatically: callers hold
/// an `Arc<dyn NetworkDevice>`, so acquiring a reference is `Arc::clone` and
/// releasing one is simply dropping the clone.
pub trait NetworkDevice: fmt::Debug + Send + Sync {
    fn tunnel_config(&self) -> Option<TunnelConfig>;
    fn change_seq(&self) -> u64;
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    /// Appends tunnel-specific framing (VXLAN/GRE/Geneve) to `buf` after the
    /// Ethernet/IPv4 header this crate wrote. Returns a driver-defined result
    /// code, propagated unchanged by `SendPath::build_header`.
    fn build_header(&self, buf: &mut OuterHeaderBuf, flow: &FlowKey) -> i32;
}

/// A fixed-configuration `NetworkDevice` for tests and the demonstration
/// binary: returns a constant `TunnelConfig` and a configurable change
/// sequence, and appends no additional framing.
#[derive(Debug)]
pub struct StaticNetworkDevice {
    name: String,
    kind: String,
    config: TunnelConfig,
    change_seq: parking_lot::Mutex<u64>,
}

impl StaticNetworkDevice {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            config,
            change_seq: parking_lot::Mutex::new(1),
        }
    }

    /// Simulates a reconfiguration event on the underlying device.
    pub fn bump_change_seq(&self) {
        *self.change_seq.lock() += 1;
    }
}

impl NetworkDevice for StaticNetworkDevice {
    fn tunnel_config(&self) -> Option<TunnelConfig> {
        Some(self.config)
    }

    fn change_seq(&self) -> u64 {
        *self.change_seq.lock()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn build_header(&self, _buf: &mut OuterHeaderBuf, _flow: &FlowKey) -> i32 {
        0
    }
}
