//! `PortRegistry`: owns the set of registered tunnel ports.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::dptable::DatapathPortTable;
use crate::match_index::MatchIndex;
use crate::netdev::NetworkDevice;
use crate::tunnel_match::{TunnelMatch, TunnelPort, UpstreamPort, IPSEC_MARK};
use crate::TunnelError;

struct Inner {
    by_upstream: HashMap<UpstreamPort, Arc<TunnelPort>>,
    index: MatchIndex,
}

impl Inner {
    fn new() -> Self {
        Self { by_upstream: HashMap::new(), index: MatchIndex::new() }
    }
}

/// Process-wide tunnel port registry. One reader-writer lock protects both
/// the upstream-port index and the match-key bucket index, so the two are
/// never observed out of sync (§5).
pub struct PortRegistry {
    inner: RwLock<Inner>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::new()) }
    }

    /// Registers `upstream_port`, reading its tunnel configuration from
    /// `netdev`.
    pub fn register(
        &self,
        upstream_port: UpstreamPort,
        netdev: Arc<dyn NetworkDevice>,
        odp_port: u32,
        native: bool,
        name: &str,
        dp_table: &dyn DatapathPortTable,
    ) -> Result<(), TunnelError> {
        let mut inner = self.inner.write();
        self.register_locked(&mut inner, upstream_port, netdev, odp_port, native, name, dp_table, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn register_locked(
        &self,
        inner: &mut Inner,
        upstream_port: UpstreamPort,
        netdev: Arc<dyn NetworkDevice>,
        odp_port: u32,
        native: bool,
        name: &str,
        dp_table: &dyn DatapathPortTable,
        warn: bool,
    ) -> Result<(), TunnelError> {
        let cfg = netdev.tunnel_config().expect("netdev must supply a tunnel config");

        // The reference is acquired (the Arc is already held by the caller,
        // cloned into the TunnelPort below) before duplicate detection runs,
        // and released (dropped) on the duplicate path — see SPEC_FULL.md §9.
        let matcher = TunnelMatch {
            in_key: cfg.in_key,
            ipv6_src: cfg.ipv6_src,
            ipv6_dst: cfg.ipv6_dst,
            odp_port,
            pkt_mark: if cfg.ipsec { IPSEC_MARK } else { 0 },
            in_key_flow: cfg.in_key_flow,
            ip_src_flow: cfg.ip_src_flow,
            ip_dst_flow: cfg.ip_dst_flow,
        };

        if let Some(existing) = inner.index.find_exact(&matcher) {
            if warn {
                tracing::warn!(
                    "{}: attempting to add tunnel port with same config as port '{}' ({})",
                    name,
                    existing.netdev.name(),
                    matcher,
                );
            }
            // `netdev` (our Arc clone) is dropped here, mirroring netdev_close.
            return Err(TunnelError::AlreadyRegistered);
        }

        let change_seq = netdev.change_seq();
        let port = Arc::new(TunnelPort { upstream_port, netdev, change_seq, matcher });

        inner.by_upstream.insert(upstream_port, port.clone());
        let inserted = inner.index.insert(port.clone());
        debug_assert!(inserted, "duplicate detection above must have caught this");

        tracing::info!("adding tunnel port {} ({})", port.netdev.name(), matcher);

        if native {
            dp_table.insert(odp_port, cfg.dst_port, name);
        }

        Ok(())
    }

    /// Idempotent; a no-op if `upstream_port` is unregistered.
    pub fn deregister(&self, upstream_port: UpstreamPort, dp_table: &dyn DatapathPortTable) {
        let mut inner = self.inner.write();
        self.deregister_locked(&mut inner, upstream_port, dp_table);
    }

    fn deregister_locked(&self, inner: &mut Inner, upstream_port: UpstreamPort, dp_table: &dyn DatapathPortTable) {
        let Some(port) = inner.by_upstream.get(&upstream_port).cloned() else {
            return;
        };

        if let Some(cfg) = port.netdev.tunnel_config() {
            dp_table.remove(cfg.dst_port);
        }

        tracing::info!("removing tunnel port {} ({})", port.netdev.name(), port.matcher);

        inner.index.remove(&port.matcher);
        inner.by_upstream.remove(&upstream_port);
        // `port`'s Arc<dyn NetworkDevice> is released here as the last strong
        // reference goes out of scope.
    }

    /// If `upstream_port` is unknown, behaves as `register`. Otherwise,
    /// re-registers only if the netdev identity, `odp_port`, or cached change
    /// sequence differ from the stored values. Returns whether anything
    /// changed.
    pub fn reconfigure(
        &self,
        upstream_port: UpstreamPort,
        netdev: Arc<dyn NetworkDevice>,
        odp_port: u32,
        native: bool,
        name: &str,
        dp_table: &dyn DatapathPortTable,
    ) -> bool {
        let mut inner = self.inner.write();

        let existing = inner.by_upstream.get(&upstream_port).cloned();
        match existing {
            None => self
                .register_locked(&mut inner, upstream_port, netdev, odp_port, native, name, dp_table, false)
                .is_ok(),
            Some(existing) => {
                let identity_differs = !Arc::ptr_eq(&existing.netdev, &netdev);
                let port_differs = existing.matcher.odp_port != odp_port;
                let seq_differs = existing.change_seq != existing.netdev.change_seq();

                if identity_differs || port_differs || seq_differs {
                    tracing::debug!("reconfiguring {}", existing.netdev.name());
                    self.deregister_locked(&mut inner, upstream_port, dp_table);
                    let _ = self.register_locked(&mut inner, upstream_port, netdev, odp_port, native, name, dp_table, true);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Reader-locked point lookup by upstream handle.
    pub fn find_by_upstream(&self, upstream_port: UpstreamPort) -> Option<Arc<TunnelPort>> {
        self.with_by_upstream(upstream_port, |port| port.cloned())
    }

    /// Reader-locked lookup via the twelve-way match index.
    pub(crate) fn find_by_flow(&self, flow: &crate::flow::FlowKey) -> Option<Arc<TunnelPort>> {
        self.with_by_flow(flow, |port| port.cloned())
    }

    /// Runs `f` with the reader lock held for the whole call, passing it the
    /// port registered under `upstream_port`, if any. `send`/`build_header`
    /// use this (rather than `find_by_upstream` followed by unlocked work) so
    /// that reading the netdev's tunnel config, mutating the flow, and
    /// building the outer header all happen under the same reader-lock
    /// acquisition, per SPEC_FULL.md §5.
    pub fn with_by_upstream<R>(&self, upstream_port: UpstreamPort, f: impl FnOnce(Option<&Arc<TunnelPort>>) -> R) -> R {
        let inner = self.inner.read();
        f(inner.by_upstream.get(&upstream_port))
    }

    /// Same as `with_by_upstream`, looked up through the twelve-way match
    /// index by flow. `receive` uses this so that the not-found warning and
    /// the debug flow-snapshot logging both run under the same reader-lock
    /// acquisition as the lookup itself.
    pub(crate) fn with_by_flow<R>(
        &self,
        flow: &crate::flow::FlowKey,
        f: impl FnOnce(Option<&Arc<TunnelPort>>) -> R,
    ) -> R {
        let inner = self.inner.read();
        f(inner.index.find_ref(flow))
    }

    /// All registered ports, for invariant testing.
    pub fn all(&self) -> Vec<Arc<TunnelPort>> {
        self.inner.read().by_upstream.values().cloned().collect()
    }
}

static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();

/// Returns the process-wide registry, initializing it on first call.
/// Concurrent first-callers coordinate through `OnceLock`, so initialization
/// happens exactly once regardless of how many threads race to call this.
pub fn global() -> &'static PortRegistry {
    GLOBAL.get_or_init(PortRegistry::new)
}
