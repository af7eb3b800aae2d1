//! The IP radix tree auto mode learns from.
//!
//! A binary trie keyed by the 32 bits of an IPv4 source address, most
//! significant bit first. Pass 1 of auto mode feeds every TCP/UDP packet's
//! source into [`IpTree::observe`]; finalization turns the per-host counters
//! into roles via a ratio test; router sub-mode then collapses uniformly
//! server-typed subtrees into covering CIDR prefixes.
//!
//! The role inversion is deliberate and is what makes the inference work: a
//! packet *to* a server port marks its source as a client, and a packet to a
//! non-service port marks its source as a server (the destination must be the
//! client, so the source is the thing being talked to).

use serde::Serialize;
use tracing::{debug, trace};

use std::net::Ipv4Addr;

use crate::PrepError;
use crate::cidr::CidrSet;

/// Role assigned to a learned host once finalization has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostRole {
    Unknown,
    Client,
    Server,
}

/// Per-host observation record stored at trie depth 32.
#[derive(Debug, Clone, Serialize)]
pub struct Leaf {
    /// The full observed address.
    pub ip: Ipv4Addr,
    /// Packets this host sent to a service destination port.
    pub client_count: u64,
    /// Packets this host sent to a non-service destination port.
    pub server_count: u64,
    /// Assigned by [`IpTree::finalize`]; `Unknown` until then.
    pub role: HostRole,
    /// 32 at insertion; reduced by aggregation to the covering prefix length.
    pub mask_len: u8,
}

#[derive(Debug, Default)]
struct Node {
    zero: Option<Box<Node>>,
    one: Option<Box<Node>>,
    leaf: Option<Leaf>,
}

/// Counts of typed leaves below a node, used by the aggregation walk.
#[derive(Debug, Clone, Copy, Default)]
struct RoleTally {
    servers: usize,
    clients: usize,
}

/// The learner. Owned by the engine for the duration of one run; immutable
/// once finalized.
#[derive(Debug, Default)]
pub struct IpTree {
    root: Node,
    leaves: usize,
}

impl IpTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct source addresses observed.
    pub fn len(&self) -> usize {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Records one observation for `ip`. `acting_as_client` is the result of
    /// the service-port test on the packet's destination port.
    pub fn observe(&mut self, ip: Ipv4Addr, acting_as_client: bool) {
        let bits = u32::from(ip);
        let mut node = &mut self.root;
        for depth in 0..32 {
            let child = if bits & (1 << (31 - depth)) == 0 {
                &mut node.zero
            } else {
                &mut node.one
            };
            node = child.get_or_insert_with(Box::default);
        }
        if node.leaf.is_none() {
            trace!(%ip, "new host");
            node.leaf = Some(Leaf {
                ip,
                client_count: 0,
                server_count: 0,
                role: HostRole::Unknown,
                mask_len: 32,
            });
            self.leaves += 1;
        }
        if let Some(leaf) = node.leaf.as_mut() {
            if acting_as_client {
                leaf.client_count += 1;
            } else {
                leaf.server_count += 1;
            }
        }
    }

    /// Assigns a role to every leaf.
    ///
    /// A host is a server when `server_count >= ratio * client_count`, a
    /// client when the symmetric inequality holds, and unknown otherwise.
    /// Hosts with no traffic at all stay unknown. `ratio` must be strictly
    /// positive; with `client_count == 0` and any server traffic the server
    /// inequality holds trivially.
    pub fn finalize(&mut self, ratio: f64) {
        fn visit(node: &mut Node, ratio: f64) {
            if let Some(leaf) = node.leaf.as_mut() {
                let clients = leaf.client_count as f64;
                let servers = leaf.server_count as f64;
                leaf.role = if leaf.client_count == 0 && leaf.server_count == 0 {
                    HostRole::Unknown
                } else if servers >= ratio * clients {
                    HostRole::Server
                } else if clients >= ratio * servers {
                    HostRole::Client
                } else {
                    HostRole::Unknown
                };
                trace!(ip = %leaf.ip, clients = leaf.client_count, servers = leaf.server_count, role = ?leaf.role, "finalized");
            }
            if let Some(child) = node.zero.as_mut() {
                visit(child, ratio);
            }
            if let Some(child) = node.one.as_mut() {
                visit(child, ratio);
            }
        }
        visit(&mut self.root, ratio);
        debug!(hosts = self.leaves, "learner finalized");
    }

    /// Role of `ip`, or `Unknown` when the address was never observed.
    pub fn role_of(&self, ip: Ipv4Addr) -> HostRole {
        let bits = u32::from(ip);
        let mut node = &self.root;
        for depth in 0..32 {
            let child = if bits & (1 << (31 - depth)) == 0 {
                &node.zero
            } else {
                &node.one
            };
            match child {
                Some(next) => node = next,
                None => return HostRole::Unknown,
            }
        }
        node.leaf
            .as_ref()
            .map(|leaf| leaf.role)
            .unwrap_or(HostRole::Unknown)
    }

    /// Collapses server subtrees into a CIDR set (router sub-mode).
    ///
    /// Walking from the root, a subtree whose typed leaves are all servers is
    /// emitted as one covering prefix once the walk is at least `min_mask`
    /// deep. When the walk reaches `max_mask` without finding a uniform
    /// subtree, each server leaf below is emitted as a /32 host route.
    /// Unknown leaves never block aggregation and may end up covered.
    ///
    /// Fails when the tree holds no server leaves at all: there is no
    /// server list to build.
    pub fn aggregate(&mut self, min_mask: u8, max_mask: u8) -> Result<CidrSet, PrepError> {
        let mut nets = CidrSet::new();
        collapse(&mut self.root, 0, 0, min_mask, max_mask, &mut nets)?;
        if nets.is_empty() {
            return Err(PrepError::NoServerNetworks);
        }
        debug!(networks = nets.len(), list = %nets, "aggregated server networks");
        Ok(nets)
    }

    /// Snapshot of all leaves in address order. Mostly for diagnostics and
    /// tests.
    pub fn leaves(&self) -> Vec<Leaf> {
        fn visit(node: &Node, out: &mut Vec<Leaf>) {
            if let Some(leaf) = node.leaf.as_ref() {
                out.push(leaf.clone());
            }
            if let Some(child) = node.zero.as_ref() {
                visit(child, out);
            }
            if let Some(child) = node.one.as_ref() {
                visit(child, out);
            }
        }
        let mut out = Vec::with_capacity(self.leaves);
        visit(&self.root, &mut out);
        out
    }
}

fn tally(node: &Node) -> RoleTally {
    let mut t = RoleTally::default();
    if let Some(leaf) = node.leaf.as_ref() {
        match leaf.role {
            HostRole::Server => t.servers += 1,
            HostRole::Client => t.clients += 1,
            HostRole::Unknown => {}
        }
    }
    for child in [node.zero.as_deref(), node.one.as_deref()].into_iter().flatten() {
        let sub = tally(child);
        t.servers += sub.servers;
        t.clients += sub.clients;
    }
    t
}

fn set_mask_below(node: &mut Node, mask_len: u8) {
    if let Some(leaf) = node.leaf.as_mut() {
        leaf.mask_len = mask_len;
    }
    for child in [node.zero.as_deref_mut(), node.one.as_deref_mut()]
        .into_iter()
        .flatten()
    {
        set_mask_below(child, mask_len);
    }
}

fn emit_server_hosts(node: &mut Node, nets: &mut CidrSet) -> Result<(), PrepError> {
    if let Some(leaf) = node.leaf.as_mut() {
        if leaf.role == HostRole::Server {
            leaf.mask_len = 32;
            nets.append(leaf.ip, 32)?;
        }
    }
    for child in [node.zero.as_deref_mut(), node.one.as_deref_mut()]
        .into_iter()
        .flatten()
    {
        emit_server_hosts(child, nets)?;
    }
    Ok(())
}

fn collapse(
    node: &mut Node,
    prefix: u32,
    depth: u8,
    min_mask: u8,
    max_mask: u8,
    nets: &mut CidrSet,
) -> Result<(), PrepError> {
    let roles = tally(node);
    if roles.servers == 0 {
        // Nothing to cover below; unknown-only subtrees emit nothing.
        return Ok(());
    }
    if roles.clients == 0 && depth >= min_mask {
        nets.append(Ipv4Addr::from(prefix), depth)?;
        set_mask_below(node, depth);
        return Ok(());
    }
    if depth >= max_mask {
        // Mixed subtree at maximum aggregation depth: fall back to host routes.
        return emit_server_hosts(node, nets);
    }
    if let Some(child) = node.zero.as_deref_mut() {
        collapse(child, prefix, depth + 1, min_mask, max_mask, nets)?;
    }
    if let Some(child) = node.one.as_deref_mut() {
        collapse(
            child,
            prefix | (1 << (31 - depth)),
            depth + 1,
            min_mask,
            max_mask,
            nets,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn counters_accumulate_per_host() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), true);
        tree.observe(ip("10.0.0.1"), true);
        tree.observe(ip("10.0.0.1"), false);
        tree.observe(ip("10.0.0.2"), false);
        assert_eq!(tree.len(), 2);
        let leaves = tree.leaves();
        assert_eq!(leaves[0].client_count, 2);
        assert_eq!(leaves[0].server_count, 1);
        assert_eq!(leaves[1].server_count, 1);
    }

    #[test]
    fn ratio_test_assigns_roles() {
        let mut tree = IpTree::new();
        // pure client
        for _ in 0..3 {
            tree.observe(ip("10.0.0.1"), true);
        }
        // server by ratio: 5 server vs 1 client, ratio 2.0
        tree.observe(ip("10.0.0.2"), true);
        for _ in 0..5 {
            tree.observe(ip("10.0.0.2"), false);
        }
        // ambiguous: 3 vs 2 under ratio 2.0
        for _ in 0..3 {
            tree.observe(ip("10.0.0.3"), false);
        }
        for _ in 0..2 {
            tree.observe(ip("10.0.0.3"), true);
        }
        tree.finalize(2.0);
        assert_eq!(tree.role_of(ip("10.0.0.1")), HostRole::Client);
        assert_eq!(tree.role_of(ip("10.0.0.2")), HostRole::Server);
        assert_eq!(tree.role_of(ip("10.0.0.3")), HostRole::Unknown);
    }

    #[test]
    fn zero_client_count_means_server() {
        let mut tree = IpTree::new();
        tree.observe(ip("192.168.0.9"), false);
        tree.finalize(2.0);
        assert_eq!(tree.role_of(ip("192.168.0.9")), HostRole::Server);
    }

    #[test]
    fn unseen_address_is_unknown() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), true);
        tree.finalize(2.0);
        assert_eq!(tree.role_of(ip("10.0.0.99")), HostRole::Unknown);
    }

    #[test]
    fn observation_order_does_not_change_roles() {
        let forward = {
            let mut tree = IpTree::new();
            tree.observe(ip("10.0.0.1"), true);
            tree.observe(ip("10.0.0.2"), false);
            tree.observe(ip("10.0.0.2"), false);
            tree.observe(ip("10.0.0.1"), true);
            tree.finalize(2.0);
            (tree.role_of(ip("10.0.0.1")), tree.role_of(ip("10.0.0.2")))
        };
        let backward = {
            let mut tree = IpTree::new();
            tree.observe(ip("10.0.0.1"), true);
            tree.observe(ip("10.0.0.2"), false);
            tree.observe(ip("10.0.0.2"), false);
            tree.observe(ip("10.0.0.1"), true);
            tree.finalize(2.0);
            (tree.role_of(ip("10.0.0.1")), tree.role_of(ip("10.0.0.2")))
        };
        assert_eq!(forward, backward);
    }

    #[test]
    fn aggregation_collapses_uniform_subtree() {
        let mut tree = IpTree::new();
        for host in 1..=7u32 {
            tree.observe(Ipv4Addr::from(0x0a000000 + host), false);
        }
        tree.finalize(2.0);
        let nets = tree.aggregate(24, 32).unwrap();
        assert_eq!(nets.to_string(), "10.0.0.0/24");
        // every learned server is covered
        for host in 1..=7u32 {
            assert!(nets.contains(Ipv4Addr::from(0x0a000000 + host)));
        }
        // and the leaves record the covering prefix
        assert!(tree.leaves().iter().all(|leaf| leaf.mask_len == 24));
    }

    #[test]
    fn aggregation_respects_min_mask() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), false);
        tree.observe(ip("10.0.1.1"), false);
        tree.finalize(2.0);
        // uniform at /16 already, but min_mask forbids anything shorter
        // than /24, so each host's /24 is emitted separately
        let nets = tree.aggregate(24, 32).unwrap();
        assert_eq!(nets.to_string(), "10.0.0.0/24,10.0.1.0/24");
    }

    #[test]
    fn mixed_subtree_at_max_mask_emits_host_routes() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), false); // server
        tree.observe(ip("10.0.0.2"), true); // client in the same /24
        tree.observe(ip("10.0.0.3"), false); // server
        tree.finalize(2.0);
        let nets = tree.aggregate(8, 24).unwrap();
        assert_eq!(nets.to_string(), "10.0.0.1/32,10.0.0.3/32");
        assert!(!nets.contains(ip("10.0.0.2")));
    }

    #[test]
    fn no_client_is_shadowed_by_aggregation() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), false);
        tree.observe(ip("10.0.0.2"), false);
        tree.observe(ip("10.0.9.1"), true);
        tree.finalize(2.0);
        let nets = tree.aggregate(8, 32).unwrap();
        assert!(nets.contains(ip("10.0.0.1")));
        assert!(nets.contains(ip("10.0.0.2")));
        assert!(!nets.contains(ip("10.0.9.1")));
    }

    #[test]
    fn unknown_leaves_do_not_block_aggregation() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), false);
        // ambiguous host in the same /24 stays unknown
        tree.observe(ip("10.0.0.2"), false);
        tree.observe(ip("10.0.0.2"), true);
        tree.finalize(2.0);
        let nets = tree.aggregate(24, 32).unwrap();
        assert_eq!(nets.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn all_clients_fails_aggregation() {
        let mut tree = IpTree::new();
        tree.observe(ip("10.0.0.1"), true);
        tree.finalize(2.0);
        assert!(matches!(
            tree.aggregate(8, 32),
            Err(PrepError::NoServerNetworks)
        ));
    }
}
