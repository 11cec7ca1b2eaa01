//! Egress index - node offers, tenant requests and the per-IP join of the two
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          EgressIndex                               │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  nodes:      node IP → NodeEgress       (offered IPs, offline)     │
//! │  namespaces: VNID    → NamespaceEgress  (requested IPs, ordered)   │
//! │  egress_ips: IP      → EgressIpInfo     (claimants + assignment)   │
//! │                                                                    │
//! │  changed_ips / changed_namespaces: work queue for the next pass    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entries reference each other by key (node IP, VNID), never by pointer.
//! All maps are ordered so a reconciliation pass visits IPs and namespaces in
//! the same order on every node.

use crate::error::EgressError;
use common::{EgressMark, Vnid};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// A node offering to host egress IPs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeEgress {
    pub node_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub requested_ips: BTreeSet<Ipv4Addr>,
    pub offline: bool,
}

/// A tenant requesting egress IPs, in failover order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceEgress {
    pub vnid: Vnid,
    pub requested_ips: Vec<Ipv4Addr>,
}

/// Everything known about one egress IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EgressIpInfo {
    pub ip: Ipv4Addr,
    /// Nodes offering this IP (more than one is a conflict)
    pub nodes: Vec<Ipv4Addr>,
    /// Namespaces requesting this IP (more than one is a conflict)
    pub namespaces: Vec<Vnid>,
    pub assigned_node_ip: Option<Ipv4Addr>,
    pub assigned_mark: Option<EgressMark>,
}

impl EgressIpInfo {
    fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            nodes: Vec::new(),
            namespaces: Vec::new(),
            assigned_node_ip: None,
            assigned_mark: None,
        }
    }

    /// No claims left and nothing assigned
    pub fn is_unused(&self) -> bool {
        self.nodes.is_empty() && self.namespaces.is_empty() && self.assigned_node_ip.is_none()
    }
}

/// Index of node offers, namespace requests and egress IPs
#[derive(Debug, Default)]
pub struct EgressIndex {
    pub(crate) nodes: BTreeMap<Ipv4Addr, NodeEgress>,
    pub(crate) namespaces: BTreeMap<Vnid, NamespaceEgress>,
    pub(crate) egress_ips: BTreeMap<Ipv4Addr, EgressIpInfo>,
    pub(crate) changed_ips: BTreeSet<Ipv4Addr>,
    pub(crate) changed_namespaces: BTreeSet<Vnid>,
}

impl EgressIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn egress_ip(&self, ip: &Ipv4Addr) -> Option<&EgressIpInfo> {
        self.egress_ips.get(ip)
    }

    pub fn node(&self, node_ip: &Ipv4Addr) -> Option<&NodeEgress> {
        self.nodes.get(node_ip)
    }

    pub fn namespace(&self, vnid: Vnid) -> Option<&NamespaceEgress> {
        self.namespaces.get(&vnid)
    }

    /// True if the node is known and currently marked offline
    pub fn node_offline(&self, node_ip: &Ipv4Addr) -> bool {
        self.nodes.get(node_ip).is_some_and(|node| node.offline)
    }

    fn ensure_egress_ip(&mut self, ip: Ipv4Addr) -> &mut EgressIpInfo {
        self.egress_ips
            .entry(ip)
            .or_insert_with(|| EgressIpInfo::new(ip))
    }

    /// Queue an egress IP, and every namespace currently requesting it, for
    /// the next reconciliation pass
    pub fn mark_changed(&mut self, ip: Ipv4Addr) {
        let Some(eg) = self.egress_ips.get(&ip) else {
            return;
        };
        self.changed_ips.insert(ip);
        self.changed_namespaces.extend(eg.namespaces.iter().copied());
    }

    pub fn add_node(&mut self, ip: Ipv4Addr, node_ip: Ipv4Addr) {
        self.ensure_egress_ip(ip).nodes.push(node_ip);
        self.mark_changed(ip);
    }

    pub fn delete_node(&mut self, ip: Ipv4Addr, node_ip: Ipv4Addr) {
        let Some(eg) = self.egress_ips.get(&ip) else {
            return;
        };
        let Some(pos) = eg.nodes.iter().position(|n| *n == node_ip) else {
            return;
        };
        self.mark_changed(ip);
        if let Some(eg) = self.egress_ips.get_mut(&ip) {
            eg.nodes.remove(pos);
        }
    }

    pub fn add_namespace(&mut self, ip: Ipv4Addr, vnid: Vnid) {
        self.ensure_egress_ip(ip).namespaces.push(vnid);
        self.mark_changed(ip);
    }

    /// Drop a namespace's claim; the namespace itself is still queued so its
    /// forwarding gets recomputed
    pub fn delete_namespace(&mut self, ip: Ipv4Addr, vnid: Vnid) {
        let Some(eg) = self.egress_ips.get(&ip) else {
            return;
        };
        let Some(pos) = eg.namespaces.iter().position(|v| *v == vnid) else {
            return;
        };
        self.mark_changed(ip);
        if let Some(eg) = self.egress_ips.get_mut(&ip) {
            eg.namespaces.remove(pos);
        }
    }

    /// Decide whether an egress IP can be assigned
    ///
    /// `Ok(false)` means "not claimed by both sides yet"; `Err` means the
    /// claims conflict and the IP stays inactive until they're fixed.
    pub fn egress_ip_active(&self, ip: &Ipv4Addr) -> Result<bool, EgressError> {
        let Some(eg) = self.egress_ips.get(ip) else {
            return Ok(false);
        };

        let (node_ip, vnid) = match (eg.nodes.as_slice(), eg.namespaces.as_slice()) {
            ([], _) | (_, []) => return Ok(false),
            ([first, second, ..], _) => {
                return Err(EgressError::MultipleNodes {
                    ip: eg.ip,
                    first: *first,
                    second: *second,
                })
            }
            (_, [first, second, ..]) => {
                return Err(EgressError::MultipleNamespaces {
                    ip: eg.ip,
                    first: *first,
                    second: *second,
                })
            }
            ([node_ip], [vnid]) => (*node_ip, *vnid),
        };

        // A tenant may not hold two egress IPs on the same node
        let requested = self
            .namespaces
            .get(&vnid)
            .map(|ns| ns.requested_ips.as_slice())
            .unwrap_or_default();
        for other in requested {
            if *other == eg.ip {
                continue;
            }
            if let Some(eg2) = self.egress_ips.get(other) {
                if eg2.nodes.as_slice() == [node_ip] {
                    return Err(EgressError::NodeDoubleBooked {
                        ip: eg.ip,
                        other: eg2.ip,
                        vnid,
                        node: node_ip,
                    });
                }
            }
        }

        Ok(true)
    }

    /// Drop entries nobody references any more
    pub fn reclaim_unused(&mut self, ips: impl IntoIterator<Item = Ipv4Addr>) {
        for ip in ips {
            if self.egress_ips.get(&ip).is_some_and(EgressIpInfo::is_unused) {
                self.egress_ips.remove(&ip);
            }
        }
    }
}
