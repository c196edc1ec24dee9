//! `ReceivePath`: resolves an incoming encapsulated packet to a tunnel port.

use std::sync::Arc;

use crate::flow::{flow_to_string, FlowKey, TunnelFlags, Wildcards, IP_ECN_CE, IP_ECN_MASK, IP_ECN_NOT_ECT};
use crate::ratelimit::RateLimiter;
use crate::registry::PortRegistry;
use crate::tunnel_match::TunnelPort;

/// Per-packet warnings ("receive tunnel port not found") are capped at one
/// per five seconds.
fn receive_rate_limit() -> &'static RateLimiter {
    static RL: std::sync::OnceLock<RateLimiter> = std::sync::OnceLock::new();
    RL.get_or_init(RateLimiter::fast)
}

/// Verbose pre/post flow diagnostic traces are capped at sixty per minute.
fn debug_rate_limit() -> &'static RateLimiter {
    static RL: std::sync::OnceLock<RateLimiter> = std::sync::OnceLock::new();
    RL.get_or_init(RateLimiter::debug)
}

/// `tnl_port_should_receive`: true if `flow` should be submitted to
/// `receive`.
pub fn should_receive(flow: &FlowKey) -> bool {
    flow.tunnel.dst.is_set()
}

/// Resolves `flow` to a registered tunnel port, under the registry's reader
/// lock for the whole call, including the not-found warning and the debug
/// flow-snapshot logging below.
pub fn receive(registry: &PortRegistry, flow: &FlowKey) -> Option<Arc<TunnelPort>> {
    registry.with_by_flow(flow, |port| match port {
        None => {
            if receive_rate_limit().allow() {
                tracing::warn!("receive tunnel port not found ({})", flow_to_string(flow));
            }
            None
        }
        Some(port) => {
            if debug_rate_limit().allow() {
                // The original snapshots the flow before and after, to show
                // what action translation subsequently mutated. This module
                // doesn't mutate `flow` itself on receive, so both snapshots
                // are identical; the pre/post framing is kept to match the
                // collaborator's logging shape for anyone grepping logs
                // across both paths.
                let snapshot = flow_to_string(flow);
                tracing::debug!("flow received\n{}\n pre: {}\npost: {}", port, snapshot, snapshot);
            }
            Some(Arc::clone(port))
        }
    })
}

/// Initializes the receive-side wildcard mask for `flow`. Must be called
/// before `process_ecn` (see `SPEC_FULL.md` §4.3 rationale).
pub fn wildcards_init(flow: &FlowKey, wildcards: &mut Wildcards) {
    if !should_receive(flow) {
        return;
    }

    wildcards.tunnel.tun_id = u64::MAX;
    if flow.tunnel.dst.is_v4() {
        wildcards.tunnel.ipv4 = true;
    } else {
        wildcards.tunnel.ipv6 = true;
    }
    wildcards.tunnel.flags = TunnelFlags::DONT_FRAGMENT | TunnelFlags::CSUM | TunnelFlags::KEY;
    wildcards.tunnel.tos = u8::MAX;
    wildcards.tunnel.ttl = u8::MAX;
    // Transport ports are always wildcarded by this module; they are never
    // unwildcarded here (mirrors the original leaving tp_src/tp_dst masks at 0).
    wildcards.tunnel.tp_src = 0;
    wildcards.tunnel.tp_dst = 0;

    wildcards.pkt_mark = u32::MAX;

    if flow.is_ip_any() && (flow.tunnel.tos & IP_ECN_MASK) == IP_ECN_CE {
        wildcards.nw_tos |= IP_ECN_MASK;
    }
}

/// Validates and applies the ECN transform for a tunnel-received flow.
/// Returns `true` if the packet should be kept, `false` if it must be
/// dropped.
pub fn process_ecn(flow: &mut FlowKey) -> bool {
    if !should_receive(flow) {
        return true;
    }

    if flow.is_ip_any() && (flow.tunnel.tos & IP_ECN_MASK) == IP_ECN_CE {
        if (flow.nw_tos & IP_ECN_MASK) == IP_ECN_NOT_ECT {
            if receive_rate_limit().allow() {
                tracing::warn!("dropping tunnel packet marked ECN CE but is not ECN capable");
            }
            return false;
        }

        flow.nw_tos |= IP_ECN_CE;
    }

    flow.pkt_mark &= !crate::tunnel_match::IPSEC_MARK;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dptable::InMemoryDatapathPortTable;
    use crate::flow::TunnelIp;
    use crate::netdev::{StaticNetworkDevice, TunnelConfig};
    use crate::registry::PortRegistry;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> TunnelIp {
        TunnelIp::V4(Ipv4Addr::new(a, b, c, d))
    }

    /// S1 — exact receive match.
    #[test]
    fn exact_receive_match() {
        let registry = PortRegistry::new();
        let table = InMemoryDatapathPortTable::new();
        let cfg = TunnelConfig {
            in_key: 0x2a,
            ipv6_src: v4(10, 0, 0, 1),
            ipv6_dst: v4(10, 0, 0, 2),
            ..Default::default()
        };
        registry
            .register(1, Arc::new(StaticNetworkDevice::new("tun0", "vxlan", cfg)), 7, false, "tun0", &table)
            .unwrap();

        let mut flow = FlowKey::default();
        flow.tunnel.tun_id = 0x2a;
        flow.tunnel.src = v4(10, 0, 0, 2);
        flow.tunnel.dst = v4(10, 0, 0, 1);
        flow.in_port = 7;

        let port = receive(&registry, &flow).expect("should match");
        assert_eq!(port.upstream_port, 1);
    }

    /// S2 — specificity precedence: a specific key beats a flow-matched key.
    #[test]
    fn specificity_precedence() {
        let registry = PortRegistry::new();
        let table = InMemoryDatapathPortTable::new();
        let endpoints = (v4(10, 0, 0, 1), v4(10, 0, 0, 2));

        let cfg_a = TunnelConfig { in_key: 0x2a, ipv6_src: endpoints.0, ipv6_dst: endpoints.1, ..Default::default() };
        let cfg_b =
            TunnelConfig { in_key_flow: true, ipv6_src: endpoints.0, ipv6_dst: endpoints.1, ..Default::default() };

        registry
            .register(1, Arc::new(StaticNetworkDevice::new("a", "vxlan", cfg_a)), 7, false, "a", &table)
            .unwrap();
        registry
            .register(2, Arc::new(StaticNetworkDevice::new("b", "vxlan", cfg_b)), 7, false, "b", &table)
            .unwrap();

        let mut flow = FlowKey::default();
        flow.tunnel.src = endpoints.1;
        flow.tunnel.dst = endpoints.0;
        flow.in_port = 7;

        flow.tunnel.tun_id = 0x2a;
        assert_eq!(receive(&registry, &flow).unwrap().upstream_port, 1);

        flow.tunnel.tun_id = 0x99;
        assert_eq!(receive(&registry, &flow).unwrap().upstream_port, 2);
    }

    /// S3 — ECN drop.
    #[test]
    fn ecn_drop_on_non_ecn_capable_inner() {
        let mut flow = FlowKey::default();
        flow.is_ip = true;
        flow.tunnel.dst = v4(10, 0, 0, 1);
        flow.tunnel.tos = 0x3; // outer ECN = CE
        flow.nw_tos = 0x0; // inner ECN = NOT-ECT

        assert!(!process_ecn(&mut flow));
    }

    #[test]
    fn wildcards_then_ecn_independent_of_ce_at_call_time() {
        let mut flow_ce = FlowKey::default();
        flow_ce.is_ip = true;
        flow_ce.tunnel.dst = v4(10, 0, 0, 1);
        flow_ce.tunnel.tos = 0x3; // CE
        flow_ce.nw_tos = 0x2; // ECT_0, so not dropped

        let mut flow_not_ce = flow_ce;
        flow_not_ce.tunnel.tos = 0x2; // ECT_0, not CE

        let mut wc_ce = Wildcards::default();
        wildcards_init(&flow_ce, &mut wc_ce);
        let mut wc_not_ce = Wildcards::default();
        wildcards_init(&flow_not_ce, &mut wc_not_ce);

        assert!(process_ecn(&mut flow_ce));
        assert!(process_ecn(&mut flow_not_ce));

        // CE toggles nw_tos mask on, but the rest of the wildcard mask (the
        // part contributed before process_ecn ever looks at CE) is identical.
        wc_ce.nw_tos = 0;
        wc_not_ce.nw_tos = 0;
        assert_eq!(wc_ce, wc_not_ce);
    }

    /// S6 — wildcards for IPv4 vs IPv6 outer.
    #[test]
    fn wildcards_branch_on_outer_ip_version() {
        let mut flow_v4 = FlowKey::default();
        flow_v4.tunnel.dst = v4(10, 0, 0, 1);
        let mut wc_v4 = Wildcards::default();
        wildcards_init(&flow_v4, &mut wc_v4);
        assert!(wc_v4.tunnel.ipv4);
        assert!(!wc_v4.tunnel.ipv6);

        let mut flow_v6 = FlowKey::default();
        flow_v6.tunnel.dst = TunnelIp::V6(std::net::Ipv6Addr::LOCALHOST);
        let mut wc_v6 = Wildcards::default();
        wildcards_init(&flow_v6, &mut wc_v6);
        assert!(wc_v6.tunnel.ipv6);
        assert!(!wc_v6.tunnel.ipv4);
    }

    #[test]
    fn process_ecn_clears_ipsec_mark() {
        let mut flow = FlowKey::default();
        flow.tunnel.dst = v4(10, 0, 0, 1);
        flow.pkt_mark = crate::tunnel_match::IPSEC_MARK | 0x10;
        assert!(process_ecn(&mut flow));
        assert_eq!(flow.pkt_mark, 0x10);
    }

    #[test]
    fn should_receive_requires_tunnel_dst() {
        let flow = FlowKey::default();
        assert!(!should_receive(&flow));
        let mut flow = flow;
        flow.tunnel.dst = v4(1, 2, 3, 4);
        assert!(should_receive(&flow));
    }
}
