//! `SendPath`: prepares an outgoing packet's tunnel metadata and outer header.

use std::net::Ipv4Addr;

use crate::flow::{FlowKey, TunnelFlags, TunnelIp, Wildcards, IP_DSCP_MASK, IP_ECN_CE, IP_ECN_ECT_0, IP_ECN_MASK};
use crate::header::{EthAddr, OuterHeaderBuf, ETH_TYPE_IP};
use crate::registry::PortRegistry;
use crate::tunnel_match::UpstreamPort;

/// Datapath port sentinel meaning "no output", mirroring `ODPP_NONE`.
pub const ODPP_NONE: u32 = u32::MAX;

/// Fills in `flow`'s tunnel metadata for output via `upstream_port`. Returns
/// the registered datapath port, or `ODPP_NONE` if `upstream_port` is
/// unregistered. Runs entirely under the registry's reader lock, including
/// the read of the netdev's tunnel config, per SPEC_FULL.md §5.
pub fn send(registry: &PortRegistry, upstream_port: UpstreamPort, flow: &mut FlowKey, wildcards: &mut Wildcards) -> u32 {
    registry.with_by_upstream(upstream_port, |port| {
        let Some(port) = port else {
            return ODPP_NONE;
        };

        let cfg = port.netdev.tunnel_config().expect("netdev must supply a tunnel config");

        if !cfg.ip_src_flow {
            flow.tunnel.src = port.matcher.ipv6_src;
        }
        if !cfg.ip_dst_flow {
            flow.tunnel.dst = port.matcher.ipv6_dst;
        }

        flow.pkt_mark = port.matcher.pkt_mark;

        if !cfg.out_key_flow {
            flow.tunnel.tun_id = cfg.out_key;
        }

        if cfg.ttl_inherit && flow.is_ip_any() {
            wildcards.nw_ttl = u8::MAX;
            flow.tunnel.ttl = flow.nw_ttl;
        } else {
            flow.tunnel.ttl = cfg.ttl;
        }

        if cfg.tos_inherit && flow.is_ip_any() {
            wildcards.nw_tos |= IP_DSCP_MASK;
            flow.tunnel.tos = flow.nw_tos & IP_DSCP_MASK;
        } else {
            flow.tunnel.tos = cfg.tos;
        }

        // ECN fields are always inherited when the inner packet is IP.
        if flow.is_ip_any() {
            wildcards.nw_tos |= IP_ECN_MASK;

            if (flow.nw_tos & IP_ECN_MASK) == IP_ECN_CE {
                flow.tunnel.tos |= IP_ECN_ECT_0;
            } else {
                flow.tunnel.tos |= flow.nw_tos & IP_ECN_MASK;
            }
        }

        let mut flags = flow.tunnel.flags;
        if cfg.dont_fragment {
            flags |= TunnelFlags::DONT_FRAGMENT;
        }
        if cfg.csum {
            flags |= TunnelFlags::CSUM;
        }
        if cfg.out_key_present {
            flags |= TunnelFlags::KEY;
        }
        flow.tunnel.flags = flags;

        port.matcher.odp_port
    })
}

/// Builds the outer Ethernet/IPv4 header template for `upstream_port`.
/// `upstream_port` must already be registered — the caller has just used it
/// to send, so an absent port is a programming error, mirroring the
/// original's `ovs_assert`. Runs entirely under the registry's reader lock,
/// including the call into the netdev's own `build_header` and the checksum
/// pass that follows it, per SPEC_FULL.md §5.
pub fn build_header(
    registry: &PortRegistry,
    upstream_port: UpstreamPort,
    flow: &FlowKey,
    dst_mac: EthAddr,
    src_mac: EthAddr,
    outer_src_ipv4: Ipv4Addr,
    out_buf: &mut OuterHeaderBuf,
) -> i32 {
    registry.with_by_upstream(upstream_port, |port| {
        let port = port.expect("build_header called for an unregistered upstream port");

        out_buf.zero();
        out_buf.put_eth_header(dst_mac, src_mac, ETH_TYPE_IP);

        let outer_dst = match flow.tunnel.dst {
            TunnelIp::V4(addr) => addr,
            _ => Ipv4Addr::UNSPECIFIED,
        };

        let range = out_buf.put_ipv4_header(
            flow.tunnel.tos,
            flow.tunnel.ttl,
            flow.tunnel.flags.contains(TunnelFlags::DONT_FRAGMENT),
            outer_src_ipv4,
            outer_dst,
        );

        // The tunnel driver's build_header runs before the checksum pass, so
        // any field it updates in the IPv4 header (e.g. ip_proto) is covered
        // by the checksum (see SPEC_FULL.md §4.4 invariant).
        let res = port.netdev.build_header(out_buf, flow);
        out_buf.fix_ipv4_checksum(range);

        res
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dptable::InMemoryDatapathPortTable;
    use crate::netdev::{StaticNetworkDevice, TunnelConfig};
    use crate::registry::PortRegistry;
    use std::sync::Arc;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> TunnelIp {
        TunnelIp::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn registry_with_port(cfg: TunnelConfig) -> (PortRegistry, InMemoryDatapathPortTable) {
        let registry = PortRegistry::new();
        let table = InMemoryDatapathPortTable::new();
        registry
            .register(1, Arc::new(StaticNetworkDevice::new("tun0", "vxlan", cfg)), 7, false, "tun0", &table)
            .unwrap();
        (registry, table)
    }

    #[test]
    fn send_unknown_port_returns_none_sentinel() {
        let registry = PortRegistry::new();
        let mut flow = FlowKey::default();
        let mut wc = Wildcards::default();
        assert_eq!(send(&registry, 42, &mut flow, &mut wc), ODPP_NONE);
    }

    /// Round-trip property 6 (IPv4 outer).
    #[test]
    fn send_fills_configured_outer_endpoints_ipv4() {
        let cfg = TunnelConfig {
            ipv6_src: v4(10, 0, 0, 1),
            ipv6_dst: v4(10, 0, 0, 2),
            out_key: 0x77,
            out_key_present: true,
            ..Default::default()
        };
        let (registry, _table) = registry_with_port(cfg);

        let mut flow = FlowKey::default();
        let mut wc = Wildcards::default();
        let odp = send(&registry, 1, &mut flow, &mut wc);

        assert_eq!(odp, 7);
        assert_eq!(flow.tunnel.src, cfg.ipv6_src);
        assert_eq!(flow.tunnel.dst, cfg.ipv6_dst);
        assert_eq!(flow.tunnel.tun_id, 0x77);
        assert!(flow.tunnel.flags.contains(TunnelFlags::KEY));
    }

    /// S4 — ECN inherit on send.
    #[test]
    fn ecn_inherit_on_send() {
        let (registry, _table) = registry_with_port(TunnelConfig { tos_inherit: true, ..Default::default() });

        let mut flow = FlowKey::default();
        flow.is_ip = true;
        flow.nw_tos = 0xA3; // DSCP=0x28(0xA0), ECN=0x3 (CE)
        let mut wc = Wildcards::default();

        send(&registry, 1, &mut flow, &mut wc);

        assert_eq!(flow.tunnel.tos & IP_ECN_MASK, IP_ECN_ECT_0);
        assert_eq!(flow.tunnel.tos & IP_DSCP_MASK, 0xA3 & IP_DSCP_MASK);
        assert_ne!(wc.nw_tos & IP_ECN_MASK, 0);
    }

    #[test]
    fn ttl_and_tos_configured_when_not_inherited() {
        let (registry, _table) = registry_with_port(TunnelConfig { ttl: 42, tos: 0x10, ..Default::default() });
        let mut flow = FlowKey::default();
        let mut wc = Wildcards::default();

        send(&registry, 1, &mut flow, &mut wc);

        assert_eq!(flow.tunnel.ttl, 42);
        assert_eq!(flow.tunnel.tos & IP_DSCP_MASK, 0x10);
    }

    #[test]
    fn ttl_inherit_copies_inner_ttl_and_wildcards_it() {
        let (registry, _table) = registry_with_port(TunnelConfig { ttl_inherit: true, ..Default::default() });
        let mut flow = FlowKey::default();
        flow.is_ip = true;
        flow.nw_ttl = 5;
        let mut wc = Wildcards::default();

        send(&registry, 1, &mut flow, &mut wc);

        assert_eq!(flow.tunnel.ttl, 5);
        assert_eq!(wc.nw_ttl, u8::MAX);
    }

    #[test]
    fn build_header_produces_valid_ipv4_template() {
        let (registry, _table) = registry_with_port(TunnelConfig::default());
        let mut flow = FlowKey::default();
        flow.tunnel.dst = v4(10, 0, 0, 2);
        flow.tunnel.flags = TunnelFlags::DONT_FRAGMENT;
        flow.tunnel.ttl = 64;
        flow.tunnel.tos = 0x10;

        let mut buf = OuterHeaderBuf::default();
        let res = build_header(&registry, 1, &flow, [1; 6], [2; 6], Ipv4Addr::new(10, 0, 0, 1), &mut buf);
        assert_eq!(res, 0);

        let ip = &buf.header[14..34];
        assert_eq!(ip[0], crate::header::IP_IHL_VER_4_5);
        assert_eq!(u16::from_be_bytes([ip[6], ip[7]]), crate::header::IP_DONT_FRAGMENT);
        assert_eq!(crate::header::ip_checksum(ip), 0);
    }

    #[test]
    #[should_panic]
    fn build_header_panics_for_unregistered_port() {
        let registry = PortRegistry::new();
        let flow = FlowKey::default();
        let mut buf = OuterHeaderBuf::default();
        build_header(&registry, 99, &flow, [0; 6], [0; 6], Ipv4Addr::UNSPECIFIED, &mut buf);
    }
}
