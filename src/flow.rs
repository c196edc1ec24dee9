//! Flow key model
//!
//! The real datapath flow key is parsed and owned by the enclosing switch
//! runtime; packet classification into this shape is out of scope for this
//! crate (see the module overview). What's defined here is the shape of the
//! fields the tunnel demultiplexer actually reads and writes, so the rest of
//! the crate has something concrete to operate on and test against.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// TOS ECN codepoints (low two bits of the TOS byte).
pub const IP_ECN_NOT_ECT: u8 = 0x0;
pub const IP_ECN_ECT_1: u8 = 0x01;
pub const IP_ECN_ECT_0: u8 = 0x02;
pub const IP_ECN_CE: u8 = 0x03;
pub const IP_ECN_MASK: u8 = 0x03;
pub const IP_DSCP_MASK: u8 = 0xfc;

/// A minimal `bitflags!`-equivalent macro, sized for the one flag set this
/// crate needs. Kept local rather than pulling in the `bitflags` crate for a
/// three-bit set.
macro_rules! bitflags_lite {
    (
        $(#[$outer:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$outer])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const EMPTY: $name = $name(0);

            pub const fn bits(self) -> $repr { self.0 }
            pub const fn from_bits_truncate(bits: $repr) -> Self { $name(bits) }
            pub const fn contains(self, other: Self) -> bool { (self.0 & other.0) == other.0 }
            pub const fn is_empty(self) -> bool { self.0 == 0 }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { $name(self.0 | rhs.0) }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0; }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self { $name(self.0 & rhs.0) }
        }
    };
}

bitflags_lite! {
    /// Tunnel flags carried in `flow.tunnel.flags`.
    pub struct TunnelFlags: u16 {
        const DONT_FRAGMENT = 1 << 0;
        const CSUM          = 1 << 1;
        const KEY           = 1 << 2;
    }
}

/// A tunnel outer address: either an IPv4 or an IPv6 endpoint, or unset.
///
/// The original source keeps every outer address as an IPv6 value, using the
/// IPv4-mapped form to represent IPv4 addresses. This crate uses a tagged
/// variant instead (see `SPEC_FULL.md` design notes); the IPv4-vs-IPv6
/// branches elsewhere in the crate switch on this enum rather than inspecting
/// a mapped-address's low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum TunnelIp {
    #[default]
    Unset,
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl TunnelIp {
    pub fn is_set(&self) -> bool {
        !matches!(self, TunnelIp::Unset)
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, TunnelIp::V4(_))
    }
}

impl fmt::Display for TunnelIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelIp::Unset => write!(f, "::"),
            TunnelIp::V4(a) => write!(f, "{a}"),
            TunnelIp::V6(a) => write!(f, "{a}"),
        }
    }
}

/// The tunnel-specific metadata carried alongside a flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowTunnel {
    /// Tunnel id (VNI for VXLAN/Geneve, Key for GRE), network byte order semantics
    /// are irrelevant at this layer; it's just a 64-bit opaque id.
    pub tun_id: u64,
    /// Outer source address (remote endpoint on receive, local endpoint on send).
    pub src: TunnelIp,
    /// Outer destination address (local endpoint on receive, remote endpoint on send).
    pub dst: TunnelIp,
    pub tos: u8,
    pub ttl: u8,
    pub flags: TunnelFlags,
    /// Transport ports are always wildcarded by this module; kept for completeness
    /// of the flow-key shape but never consulted by matching logic.
    pub tp_src: u16,
    pub tp_dst: u16,
}

/// A (heavily trimmed) datapath flow key: only the fields this crate reads or
/// writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowKey {
    pub tunnel: FlowTunnel,
    /// Datapath ingress port.
    pub in_port: u32,
    /// Socket-buffer mark.
    pub pkt_mark: u32,
    /// Inner packet's TOS byte.
    pub nw_tos: u8,
    /// Inner packet's TTL.
    pub nw_ttl: u8,
    /// True if the inner packet is IPv4 or IPv6 (as opposed to non-IP).
    pub is_ip: bool,
}

impl FlowKey {
    /// Mirrors `is_ip_any()`: true if the inner packet carries an IP header at all.
    pub fn is_ip_any(&self) -> bool {
        self.is_ip
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel(tun_id={:#x},src={},dst={},tos={:#x},ttl={},flags={:?}),in_port={},pkt_mark={:#x},nw_tos={:#x},nw_ttl={}",
            self.tunnel.tun_id,
            self.tunnel.src,
            self.tunnel.dst,
            self.tunnel.tos,
            self.tunnel.ttl,
            self.tunnel.flags,
            self.in_port,
            self.pkt_mark,
            self.nw_tos,
            self.nw_ttl,
        )
    }
}

/// Renders `flow` for diagnostic logging, mirroring `flow_to_string()`.
pub fn flow_to_string(flow: &FlowKey) -> String {
    flow.to_string()
}

/// Wildcard masks recorded alongside a flow key, mirroring `struct flow_wildcards`
/// restricted to the fields this module ever touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelWildcardMask {
    pub tun_id: u64,
    pub ipv4: bool,
    pub ipv6: bool,
    pub flags: TunnelFlags,
    pub tos: u8,
    pub ttl: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wildcards {
    pub tunnel: TunnelWildcardMask,
    pub pkt_mark: u32,
    /// Inner-packet TOS mask; ORed into by ECN/DSCP inheritance.
    pub nw_tos: u8,
    pub nw_ttl: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_flags_combine() {
        let f = TunnelFlags::DONT_FRAGMENT | TunnelFlags::CSUM;
        assert!(f.contains(TunnelFlags::DONT_FRAGMENT));
        assert!(f.contains(TunnelFlags::CSUM));
        assert!(!f.contains(TunnelFlags::KEY));
    }

    #[test]
    fn tunnel_ip_display() {
        assert_eq!(TunnelIp::Unset.to_string(), "::");
        assert_eq!(TunnelIp::V4(Ipv4Addr::new(10, 0, 0, 1)).to_string(), "10.0.0.1");
    }
}
