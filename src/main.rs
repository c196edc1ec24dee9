//! Tunnel demux demonstration binary.
//!
//! Wires up a `PortRegistry` with a couple of static tunnel ports and walks a
//! packet through the receive and send paths, logging each step. This is a
//! smoke test you can run by eye, not a production entry point - the
//! registry, network devices and datapath port table all come from the
//! enclosing switch in a real deployment (see `SPEC_FULL.md` §1).

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_demux::dptable::InMemoryDatapathPortTable;
use tunnel_demux::flow::{FlowKey, TunnelIp, Wildcards};
use tunnel_demux::header::OuterHeaderBuf;
use tunnel_demux::netdev::StaticNetworkDevice;
use tunnel_demux::{receive, send, NetworkDevice, PortRegistry, TunnelConfig};

fn v4(a: u8, b: u8, c: u8, d: u8) -> TunnelIp {
    TunnelIp::V4(Ipv4Addr::new(a, b, c, d))
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = PortRegistry::new();
    let dp_table = InMemoryDatapathPortTable::new();

    let branch_office = TunnelConfig {
        in_key: 0x2a,
        ipv6_src: v4(198, 51, 100, 1),
        ipv6_dst: v4(198, 51, 100, 2),
        out_key: 0x2a,
        out_key_present: true,
        ttl: 64,
        csum: true,
        ..Default::default()
    };
    let branch_netdev: Arc<dyn NetworkDevice> =
        Arc::new(StaticNetworkDevice::new("vxlan-branch0", "vxlan", branch_office));

    registry
        .register(1, branch_netdev, 100, true, "vxlan-branch0", &dp_table)
        .expect("first registration always succeeds");

    let catchall = TunnelConfig { in_key_flow: true, ip_src_flow: true, ip_dst_flow: true, ..Default::default() };
    let catchall_netdev: Arc<dyn NetworkDevice> = Arc::new(StaticNetworkDevice::new("vxlan-any", "vxlan", catchall));
    registry
        .register(2, catchall_netdev, 101, true, "vxlan-any", &dp_table)
        .expect("distinct match key from port 1");

    tracing::info!("registered ports:");
    for port in registry.all() {
        tracing::info!("  {}", port);
    }

    // A packet arriving from the branch office, matching port 1 exactly.
    let mut inbound = FlowKey::default();
    inbound.tunnel.tun_id = 0x2a;
    inbound.tunnel.src = v4(198, 51, 100, 2);
    inbound.tunnel.dst = v4(198, 51, 100, 1);
    inbound.in_port = 100;

    let mut wildcards = Wildcards::default();
    receive::wildcards_init(&inbound, &mut wildcards);
    if receive::process_ecn(&mut inbound) {
        match receive::receive(&registry, &inbound) {
            Some(port) => tracing::info!("inbound packet resolved to upstream port {}", port.upstream_port),
            None => tracing::warn!("inbound packet did not match any tunnel port"),
        }
    }

    // Send a packet back out port 1.
    let mut outbound = FlowKey::default();
    outbound.is_ip = true;
    outbound.nw_ttl = 60;
    let mut send_wc = Wildcards::default();
    let odp_port = send::send(&registry, 1, &mut outbound, &mut send_wc);
    tracing::info!("send resolved to datapath port {}", odp_port);

    let mut header = OuterHeaderBuf::default();
    let result = send::build_header(
        &registry,
        1,
        &outbound,
        [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
        [0x00, 0x66, 0x77, 0x88, 0x99, 0xaa],
        Ipv4Addr::new(198, 51, 100, 1),
        &mut header,
    );
    tracing::info!("build_header returned {}, wrote {} bytes", result, header.len);
}
