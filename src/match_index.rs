//! The twelve-way bucketed lookup structure used by the receive path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::flow::FlowKey;
use crate::tunnel_match::{IpSrcCategory, TunnelMatch, TunnelPort};

const N_MATCH_TYPES: usize = 12;

/// Array of twelve lazily-allocated buckets, selected by
/// `TunnelMatch::bucket_index`.
#[derive(Default)]
pub struct MatchIndex {
    buckets: [Option<HashMap<TunnelMatch, Arc<TunnelPort>>>; N_MATCH_TYPES],
}

impl MatchIndex {
    pub fn new() -> Self {
        Self { buckets: Default::default() }
    }

    /// Returns the existing entry with an identical `TunnelMatch`, if any.
    pub fn find_exact(&self, matcher: &TunnelMatch) -> Option<Arc<TunnelPort>> {
        self.find_exact_ref(matcher).cloned()
    }

    fn find_exact_ref(&self, matcher: &TunnelMatch) -> Option<&Arc<TunnelPort>> {
        self.buckets[matcher.bucket_index()].as_ref().and_then(|bucket| bucket.get(matcher))
    }

    /// Inserts `port` into its bucket (allocating it if empty). Returns
    /// `false` without mutating anything if an identical match is already
    /// present.
    pub fn insert(&mut self, port: Arc<TunnelPort>) -> bool {
        let idx = port.matcher.bucket_index();
        if self.buckets[idx].as_ref().is_some_and(|b| b.contains_key(&port.matcher)) {
            return false;
        }
        self.buckets[idx].get_or_insert_with(HashMap::new).insert(port.matcher, port);
        true
    }

    /// Removes the entry matching `matcher`, freeing the bucket if it becomes
    /// empty.
    pub fn remove(&mut self, matcher: &TunnelMatch) -> Option<Arc<TunnelPort>> {
        let idx = matcher.bucket_index();
        let bucket = self.buckets[idx].as_mut()?;
        let removed = bucket.remove(matcher);
        if bucket.is_empty() {
            self.buckets[idx] = None;
        }
        removed
    }

    /// The twelve-way priority search over configuration variants (§4.2):
    /// enumerates `(in_key_flow, ip_dst_flow, ip_src_category)` in
    /// lexicographic order, `in_key_flow` outermost, and returns the first
    /// exact match.
    pub fn find(&self, flow: &FlowKey) -> Option<Arc<TunnelPort>> {
        self.find_ref(flow).cloned()
    }

    /// Same search as `find`, but borrows from the index instead of cloning
    /// the `Arc`, so a caller holding the index's lock can keep it held for
    /// the rest of a per-packet operation (see `PortRegistry::with_by_flow`).
    pub fn find_ref(&self, flow: &FlowKey) -> Option<&Arc<TunnelPort>> {
        for in_key_flow in [false, true] {
            for ip_dst_flow in [false, true] {
                for ip_src in [IpSrcCategory::Cfg, IpSrcCategory::Any, IpSrcCategory::Flow] {
                    // The apparent mix-up of src/dst below is intentional: a
                    // TunnelMatch is expressed in terms of packets being sent
                    // out, but we're using it here to describe how to treat a
                    // received packet (see SPEC_FULL.md §4.2's note on the
                    // source/destination swap).
                    let probe = TunnelMatch {
                        in_key: if in_key_flow { 0 } else { flow.tunnel.tun_id },
                        ipv6_src: if ip_src == IpSrcCategory::Cfg { flow.tunnel.dst } else { Default::default() },
                        ipv6_dst: if ip_dst_flow { Default::default() } else { flow.tunnel.src },
                        odp_port: flow.in_port,
                        pkt_mark: flow.pkt_mark,
                        in_key_flow,
                        ip_dst_flow,
                        ip_src_flow: ip_src == IpSrcCategory::Flow,
                    };

                    if let Some(port) = self.find_exact_ref(&probe) {
                        return Some(port);
                    }
                }
            }
        }
        None
    }

    /// All registered ports across every bucket, used by the registry's
    /// cross-index consistency invariant and by tests.
    pub fn all(&self) -> Vec<Arc<TunnelPort>> {
        self.buckets.iter().flatten().flat_map(|b| b.values().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::{StaticNetworkDevice, TunnelConfig};

    fn port(matcher: TunnelMatch, upstream: u64) -> Arc<TunnelPort> {
        Arc::new(TunnelPort {
            upstream_port: upstream,
            netdev: Arc::new(StaticNetworkDevice::new("p", "vxlan", TunnelConfig::default())),
            change_seq: 1,
            matcher,
        })
    }

    #[test]
    fn insert_rejects_duplicate_without_mutating() {
        let mut idx = MatchIndex::new();
        let m = TunnelMatch { in_key: 0x2a, odp_port: 7, ..Default::default() };
        assert!(idx.insert(port(m, 1)));
        assert!(!idx.insert(port(m, 2)));
        assert_eq!(idx.all().len(), 1);
        assert_eq!(idx.find_exact(&m).unwrap().upstream_port, 1);
    }

    #[test]
    fn remove_frees_empty_bucket() {
        let mut idx = MatchIndex::new();
        let m = TunnelMatch { in_key: 0x2a, odp_port: 7, ..Default::default() };
        idx.insert(port(m, 1));
        assert!(idx.remove(&m).is_some());
        assert!(idx.find_exact(&m).is_none());
        assert!(idx.all().is_empty());
    }
}
