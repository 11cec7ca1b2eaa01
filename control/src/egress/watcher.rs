//! Egress IP watcher - reconciles node offers and tenant requests
//!
//! Every mutation runs in two phases under one lock:
//!
//! 1. **Index**: apply the set difference between the old and new claim
//!    lists, queueing every touched IP and namespace as "changed".
//! 2. **Sync**: drain the queues. Each changed IP runs the assignment state
//!    machine (claiming or releasing it locally if this node owns it), then
//!    each changed namespace gets its forwarding mode recomputed.
//!
//! ```text
//!   Unassigned ──(active, winner differs)──► Assigned(node)
//!       ▲                                        │
//!       └──────────────(inactive)────────────────┘
//! ```
//!
//! Conflicts and local failures never abort a pass; they leave the binding
//! unassigned and the affected tenant's traffic dropped.

use super::adapters::{ForwardingProgrammer, LivenessTracker};
use super::claims::LocalClaims;
use super::index::{EgressIndex, EgressIpInfo, NamespaceEgress, NodeEgress};
use super::safe_lock;
use crate::apis::metrics::{
    record_conflict, record_local_claim, record_namespace_egress, record_sync_pass,
};
use common::{EgressMark, EgressMode, Vnid};
use serde::Serialize;
use std::collections::BTreeSet;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Coordinates egress IP assignment for one node
pub struct EgressIpWatcher {
    local_ip: Ipv4Addr,
    masquerade_bit: u32,
    claims: LocalClaims,
    forwarding: Arc<dyn ForwardingProgrammer>,
    liveness: Option<Arc<dyn LivenessTracker>>,
    index: Mutex<EgressIndex>,
}

/// Point-in-time view of the index, for debugging endpoints and tests
#[derive(Debug, Clone, Serialize)]
pub struct EgressSnapshot {
    pub local_ip: Ipv4Addr,
    pub nodes: Vec<NodeEgress>,
    pub namespaces: Vec<NamespaceEgress>,
    pub egress_ips: Vec<EgressIpInfo>,
}

impl EgressIpWatcher {
    /// Create a watcher for the node with IP `local_ip`
    ///
    /// `masquerade_bit` is the mask (not the index) of the SDN's masquerade
    /// bit, or 0 if none is reserved.
    pub fn new(
        local_ip: Ipv4Addr,
        masquerade_bit: u32,
        claims: LocalClaims,
        forwarding: Arc<dyn ForwardingProgrammer>,
    ) -> Self {
        Self {
            local_ip,
            masquerade_bit,
            claims,
            forwarding,
            liveness: None,
            index: Mutex::new(EgressIndex::new()),
        }
    }

    /// Register remote egress nodes with a liveness monitor
    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessTracker>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Mark a tenant's traffic gets on this cluster
    pub fn mark_for_vnid(&self, vnid: Vnid) -> EgressMark {
        EgressMark::for_vnid(vnid, self.masquerade_bit)
    }

    // =========================================================================
    // Mutation entry points
    // =========================================================================

    /// Apply a node's current egress IP offer
    ///
    /// An empty list removes the node. Replaying the same offer is a no-op.
    pub fn update_node_egress(
        &self,
        node_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        egress_ips: &[Ipv4Addr],
    ) {
        let mut index = safe_lock(&self.index);
        self.apply_node_egress(&mut index, node_ip, gateway_ip, egress_ips);
        self.sync_egress_ips(&mut index);
    }

    /// Forget a node entirely (its HostSubnet was deleted)
    pub fn delete_node_egress(&self, node_ip: Ipv4Addr) {
        let mut index = safe_lock(&self.index);
        self.apply_node_egress(&mut index, node_ip, Ipv4Addr::UNSPECIFIED, &[]);
        self.sync_egress_ips(&mut index);
    }

    /// Apply a tenant's current, ordered egress IP request
    ///
    /// An empty list removes the namespace and restores normal egress.
    pub fn update_namespace_egress(&self, vnid: Vnid, egress_ips: &[Ipv4Addr]) {
        let mut index = safe_lock(&self.index);
        Self::apply_namespace_egress(&mut index, vnid, egress_ips);
        self.sync_egress_ips(&mut index);
    }

    /// Forget a tenant entirely (its NetNamespace was deleted)
    pub fn delete_namespace_egress(&self, vnid: Vnid) {
        self.update_namespace_egress(vnid, &[]);
    }

    /// Record a liveness verdict for a node and fail over if needed
    pub fn update_node(&self, node_ip: Ipv4Addr, offline: bool) {
        let mut index = safe_lock(&self.index);

        let Some(node) = index.nodes.get_mut(&node_ip) else {
            // Stale event for a node that no longer offers egress IPs
            if let Some(liveness) = &self.liveness {
                liveness.remove_node(node_ip);
            }
            return;
        };

        // A verdict queued before the node was re-registered is stale
        if let Some(liveness) = &self.liveness {
            if liveness.is_offline(node_ip) != offline {
                debug!(
                    node = %node_ip,
                    offline = offline,
                    "Ignoring superseded liveness event"
                );
                return;
            }
        }

        if node.offline != offline {
            info!(
                node = %node_ip,
                offline = offline,
                "Egress node liveness changed"
            );
        }
        node.offline = offline;
        let offered: Vec<Ipv4Addr> = node.requested_ips.iter().copied().collect();
        for ip in offered {
            index.mark_changed(ip);
        }

        self.sync_egress_ips(&mut index);
    }

    /// Copy of the current index
    pub fn snapshot(&self) -> EgressSnapshot {
        let index = safe_lock(&self.index);
        EgressSnapshot {
            local_ip: self.local_ip,
            nodes: index.nodes.values().cloned().collect(),
            namespaces: index.namespaces.values().cloned().collect(),
            egress_ips: index.egress_ips.values().cloned().collect(),
        }
    }

    /// Node an egress IP is currently assigned to
    pub fn assigned_node(&self, egress_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        safe_lock(&self.index)
            .egress_ip(&egress_ip)
            .and_then(|eg| eg.assigned_node_ip)
    }

    // =========================================================================
    // Phase 1: index mutation
    // =========================================================================

    fn apply_node_egress(
        &self,
        index: &mut EgressIndex,
        node_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        egress_ips: &[Ipv4Addr],
    ) {
        let new_ips: BTreeSet<Ipv4Addr> = egress_ips.iter().copied().collect();

        let old_ips = match index.nodes.get_mut(&node_ip) {
            Some(node) => mem::replace(&mut node.requested_ips, new_ips.clone()),
            None if new_ips.is_empty() => return,
            None => {
                debug!(node = %node_ip, gateway = %gateway_ip, "Tracking new egress node");
                index.nodes.insert(
                    node_ip,
                    NodeEgress {
                        node_ip,
                        gateway_ip,
                        requested_ips: new_ips.clone(),
                        offline: false,
                    },
                );
                if node_ip != self.local_ip {
                    if let Some(liveness) = &self.liveness {
                        liveness.add_node(node_ip, gateway_ip);
                    }
                }
                BTreeSet::new()
            }
        };

        if new_ips.is_empty() {
            debug!(node = %node_ip, "Egress node no longer offers any IPs");
            index.nodes.remove(&node_ip);
            if let Some(liveness) = &self.liveness {
                liveness.remove_node(node_ip);
            }
        }

        for ip in new_ips.difference(&old_ips) {
            index.add_node(*ip, node_ip);
        }
        for ip in old_ips.difference(&new_ips) {
            index.delete_node(*ip, node_ip);
        }
    }

    fn apply_namespace_egress(index: &mut EgressIndex, vnid: Vnid, egress_ips: &[Ipv4Addr]) {
        let old_list = match index.namespaces.get_mut(&vnid) {
            Some(ns) => mem::replace(&mut ns.requested_ips, egress_ips.to_vec()),
            None if egress_ips.is_empty() => return,
            None => {
                index.namespaces.insert(
                    vnid,
                    NamespaceEgress {
                        vnid,
                        requested_ips: egress_ips.to_vec(),
                    },
                );
                Vec::new()
            }
        };

        if egress_ips.is_empty() {
            index.namespaces.remove(&vnid);
        }

        let old_ips: BTreeSet<Ipv4Addr> = old_list.into_iter().collect();
        let new_ips: BTreeSet<Ipv4Addr> = egress_ips.iter().copied().collect();

        for ip in new_ips.difference(&old_ips) {
            index.add_namespace(*ip, vnid);
        }
        for ip in old_ips.difference(&new_ips) {
            index.delete_namespace(*ip, vnid);
        }
        // Unchanged IPs count as changed too, so reorderings get re-synced
        for ip in new_ips.intersection(&old_ips) {
            index.mark_changed(*ip);
        }
        // The namespace itself may have no remaining IP entries to queue it
        index.changed_namespaces.insert(vnid);
    }

    // =========================================================================
    // Phase 2: reconciliation
    // =========================================================================

    fn sync_egress_ips(&self, index: &mut EgressIndex) {
        let start = Instant::now();
        let changed_ips = mem::take(&mut index.changed_ips);
        let changed_namespaces = mem::take(&mut index.changed_namespaces);

        for ip in &changed_ips {
            let active = match index.egress_ip_active(ip) {
                Ok(active) => active,
                Err(e) => {
                    warn!(egress_ip = %ip, error = %e, "Egress IP left unassigned");
                    if let Some(kind) = e.conflict_kind() {
                        record_conflict(kind);
                    }
                    false
                }
            };
            self.sync_egress_node_state(index, *ip, active);
        }
        index.reclaim_unused(changed_ips.iter().copied());

        for vnid in &changed_namespaces {
            self.sync_egress_namespace_state(index, *vnid);
        }

        record_sync_pass(
            changed_ips.len(),
            changed_namespaces.len(),
            start.elapsed().as_secs_f64(),
        );
    }

    fn sync_egress_node_state(&self, index: &mut EgressIndex, ip: Ipv4Addr, active: bool) {
        let Some(eg) = index.egress_ips.get_mut(&ip) else {
            return;
        };

        let winner = match (active, eg.nodes.first(), eg.namespaces.first()) {
            (true, Some(node_ip), Some(vnid)) => Some((*node_ip, *vnid)),
            _ => None,
        };

        match winner {
            Some((node_ip, vnid)) if eg.assigned_node_ip != Some(node_ip) => {
                if eg.assigned_node_ip.is_some() {
                    self.release_assignment(eg);
                }

                let mark = self.mark_for_vnid(vnid);
                info!(egress_ip = %ip, node = %node_ip, vnid = vnid, %mark, "Assigning egress IP");
                eg.assigned_node_ip = Some(node_ip);
                eg.assigned_mark = Some(mark);

                if node_ip == self.local_ip {
                    let result = self.claims.claim(self.local_ip, ip, mark);
                    record_local_claim("claim", result.is_ok());
                    if let Err(e) = result {
                        warn!(egress_ip = %ip, error = %e, "Error assigning egress IP");
                        eg.assigned_node_ip = None;
                        eg.assigned_mark = None;
                    }
                }
            }
            None if eg.assigned_node_ip.is_some() => self.release_assignment(eg),
            _ => {}
        }
    }

    /// Tear down an assignment (locally, if this node held it) and clear it
    fn release_assignment(&self, eg: &mut EgressIpInfo) {
        if let Some(node_ip) = eg.assigned_node_ip {
            info!(egress_ip = %eg.ip, node = %node_ip, "Removing egress IP");
            if node_ip == self.local_ip {
                if let Some(mark) = eg.assigned_mark {
                    let result = self.claims.release(self.local_ip, eg.ip, mark);
                    record_local_claim("release", result.is_ok());
                    if let Err(e) = result {
                        warn!(egress_ip = %eg.ip, error = %e, "Error releasing egress IP");
                    }
                }
            }
        }
        eg.assigned_node_ip = None;
        eg.assigned_mark = None;
    }

    fn sync_egress_namespace_state(&self, index: &EgressIndex, vnid: Vnid) {
        let mode = namespace_egress_mode(index, vnid);
        let result = self.forwarding.set_namespace_egress(vnid, &mode);
        record_namespace_egress(mode.as_str(), result.is_ok());
        match result {
            Ok(()) => debug!(vnid = vnid, %mode, "Updated namespace egress"),
            Err(e) => warn!(
                vnid = vnid,
                %mode,
                error = %e,
                "Error updating namespace egress rules"
            ),
        }
    }
}

/// Pick the forwarding mode for a tenant
///
/// The first requested IP that is assigned (and whose node is online, when
/// there is an alternative) wins. Any requested IP shared with another tenant
/// disables egress for the whole tenant.
pub fn namespace_egress_mode(index: &EgressIndex, vnid: Vnid) -> EgressMode {
    let requested = index
        .namespace(vnid)
        .map(|ns| ns.requested_ips.as_slice())
        .unwrap_or_default();
    if requested.is_empty() {
        return EgressMode::Normal;
    }

    let mut active = None;
    for ip in requested {
        let Some(eg) = index.egress_ip(ip) else {
            continue;
        };
        if eg.namespaces.len() > 1 {
            debug!(vnid = vnid, egress_ip = %ip, "Namespace gets no egress due to multiply-assigned egress IP");
            return EgressMode::Dropped;
        }
        if active.is_some() {
            continue;
        }

        match (eg.assigned_node_ip, eg.assigned_mark) {
            (Some(node_ip), Some(mark)) => {
                let owner_offline = eg.nodes.first().is_some_and(|n| index.node_offline(n));
                if requested.len() > 1 && owner_offline {
                    debug!(vnid = vnid, egress_ip = %ip, node = %node_ip, "Namespace cannot use egress IP on offline node");
                } else {
                    active = Some(EgressMode::ViaEgressIp { node_ip, mark });
                }
            }
            _ => debug!(vnid = vnid, egress_ip = %ip, "Namespace cannot use unassigned egress IP"),
        }
    }

    active.unwrap_or(EgressMode::Dropped)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::egress::adapters::{AddressManager, EgressLink, MarkRuleManager};
    use crate::error::EgressError;
    use ipnet::Ipv4Net;

    const NODE_A: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 3);
    const NODE_B: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 4);
    const GATEWAY_A: Ipv4Addr = Ipv4Addr::new(10, 129, 0, 1);
    const GATEWAY_B: Ipv4Addr = Ipv4Addr::new(10, 130, 0, 1);
    const IP1: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 100);
    const IP2: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 101);
    const CONFLICT_IP: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 5);

    /// Records every side effect in order
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_address_add: Mutex<bool>,
        offline: Mutex<BTreeSet<Ipv4Addr>>,
    }

    impl Recorder {
        /// Flip the monitor's verdict and deliver it, as a probe loop would
        fn report(&self, watcher: &EgressIpWatcher, node_ip: Ipv4Addr, offline: bool) {
            {
                let mut nodes = self.offline.lock().unwrap();
                if offline {
                    nodes.insert(node_ip);
                } else {
                    nodes.remove(&node_ip);
                }
            }
            watcher.update_node(node_ip, offline);
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<String> {
            mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl AddressManager for Recorder {
        fn add_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
            if *self.fail_address_add.lock().unwrap() {
                return Err(EgressError::Host(crate::error::HostError::CommandFailed {
                    command: "ip addr add".to_string(),
                    stderr: "Operation not permitted".to_string(),
                }));
            }
            self.push(format!("addr add {} dev {}", address, link.name));
            Ok(())
        }

        fn delete_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
            self.push(format!("addr del {} dev {}", address, link.name));
            Ok(())
        }
    }

    impl MarkRuleManager for Recorder {
        fn add_egress_ip_rules(&self, ip: Ipv4Addr, mark: EgressMark) -> Result<(), EgressError> {
            self.push(format!("rules add {} {}", ip, mark));
            Ok(())
        }

        fn delete_egress_ip_rules(
            &self,
            ip: Ipv4Addr,
            mark: EgressMark,
        ) -> Result<(), EgressError> {
            self.push(format!("rules del {} {}", ip, mark));
            Ok(())
        }
    }

    impl ForwardingProgrammer for Recorder {
        fn set_namespace_egress(&self, vnid: Vnid, mode: &EgressMode) -> Result<(), EgressError> {
            self.push(format!("namespace {} {}", vnid, mode));
            Ok(())
        }
    }

    impl LivenessTracker for Recorder {
        fn add_node(&self, node_ip: Ipv4Addr, gateway_ip: Ipv4Addr) {
            self.push(format!("monitor {} via {}", node_ip, gateway_ip));
        }

        fn remove_node(&self, node_ip: Ipv4Addr) {
            self.offline.lock().unwrap().remove(&node_ip);
            self.push(format!("unmonitor {}", node_ip));
        }

        fn is_offline(&self, node_ip: Ipv4Addr) -> bool {
            self.offline.lock().unwrap().contains(&node_ip)
        }
    }

    /// Watcher running on NODE_A with every side effect going to one recorder
    fn watcher_on_node_a() -> (EgressIpWatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let claims = LocalClaims::kernel(
            EgressLink::new("eth0", "172.17.0.0/16".parse().unwrap()),
            recorder.clone(),
            recorder.clone(),
        );
        let watcher = EgressIpWatcher::new(NODE_A, 1, claims, recorder.clone())
            .with_liveness(recorder.clone());
        (watcher, recorder)
    }

    #[test]
    fn test_local_assignment_end_to_end() {
        let (watcher, recorder) = watcher_on_node_a();

        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        assert!(
            recorder.take().is_empty(),
            "Offer alone changes nothing (local node is not monitored)"
        );

        watcher.update_namespace_egress(42, &[IP1]);
        assert_eq!(watcher.assigned_node(IP1), Some(NODE_A));
        assert_eq!(
            recorder.take(),
            vec![
                "addr add 172.17.0.100/16 dev eth0",
                "rules add 172.17.0.100 0x0000002a",
                "namespace 42 via 172.17.0.3 (mark 0x0000002a)",
            ]
        );
    }

    #[test]
    fn test_remote_assignment_programs_forwarding_only() {
        let (watcher, recorder) = watcher_on_node_a();

        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1]);
        assert_eq!(recorder.take(), vec!["monitor 172.17.0.4 via 10.130.0.1"]);

        watcher.update_namespace_egress(7, &[IP1]);
        assert_eq!(watcher.assigned_node(IP1), Some(NODE_B));
        assert_eq!(
            recorder.take(),
            vec!["namespace 7 via 172.17.0.4 (mark 0x01000006)"]
        );
    }

    #[test]
    fn test_emptied_request_restores_normal_and_tears_down_once() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        recorder.take();

        watcher.update_namespace_egress(42, &[]);
        assert_eq!(watcher.assigned_node(IP1), None);
        assert_eq!(
            recorder.take(),
            vec![
                "addr del 172.17.0.100/16 dev eth0",
                "rules del 172.17.0.100 0x0000002a",
                "namespace 42 normal",
            ]
        );

        // Deleting again changes nothing
        watcher.delete_namespace_egress(42);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_replayed_node_update_is_idempotent() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        recorder.take();

        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);

        assert!(recorder.take().is_empty(), "Replays must not re-program");
        assert_eq!(watcher.assigned_node(IP1), Some(NODE_A));
    }

    #[test]
    fn test_unassigned_request_is_dropped_not_normal() {
        let (watcher, recorder) = watcher_on_node_a();

        watcher.update_namespace_egress(42, &[IP1]);

        assert_eq!(recorder.take(), vec!["namespace 42 dropped"]);
    }

    #[test]
    fn test_two_nodes_claiming_one_ip_stays_inactive() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[CONFLICT_IP]);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[CONFLICT_IP]);
        watcher.update_namespace_egress(42, &[CONFLICT_IP]);

        let calls = recorder.take();
        assert!(
            !calls.iter().any(|c| c.starts_with("addr")),
            "No address changes on conflict: {:?}",
            calls
        );
        assert_eq!(watcher.assigned_node(CONFLICT_IP), None);
        assert_eq!(calls.last().unwrap(), "namespace 42 dropped");
    }

    #[test]
    fn test_conflict_releases_existing_local_claim() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        recorder.take();

        // A second tenant grabs the same IP: both lose it
        watcher.update_namespace_egress(43, &[IP1]);

        assert_eq!(watcher.assigned_node(IP1), None);
        assert_eq!(
            recorder.take(),
            vec![
                "addr del 172.17.0.100/16 dev eth0",
                "rules del 172.17.0.100 0x0000002a",
                "namespace 42 dropped",
                "namespace 43 dropped",
            ]
        );

        // First tenant gives it up, second one gets it
        watcher.update_namespace_egress(42, &[]);
        assert_eq!(
            recorder.take(),
            vec![
                "addr add 172.17.0.100/16 dev eth0",
                "rules add 172.17.0.100 0x0100002a",
                "namespace 42 normal",
                "namespace 43 via 172.17.0.3 (mark 0x0100002a)",
            ]
        );
    }

    #[test]
    fn test_double_booked_node_drops_namespace() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1, IP2]);
        recorder.take();

        watcher.update_namespace_egress(42, &[IP1, IP2]);

        assert_eq!(watcher.assigned_node(IP1), None);
        assert_eq!(watcher.assigned_node(IP2), None);
        assert_eq!(recorder.take(), vec!["namespace 42 dropped"]);
    }

    #[test]
    fn test_failover_to_second_ip_when_owner_offline() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP2]);
        watcher.update_namespace_egress(42, &[IP2, IP1]);
        recorder.take();

        recorder.report(&watcher, NODE_B, true);
        assert_eq!(
            recorder.take(),
            vec!["namespace 42 via 172.17.0.3 (mark 0x0000002a)"],
            "Should fail over to the online node"
        );

        recorder.report(&watcher, NODE_B, false);
        assert_eq!(
            recorder.take(),
            vec!["namespace 42 via 172.17.0.4 (mark 0x0000002a)"],
            "Should move back once the preferred node recovers"
        );
    }

    #[test]
    fn test_single_candidate_tolerates_offline_owner() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        recorder.take();

        recorder.report(&watcher, NODE_B, true);

        assert_eq!(
            recorder.take(),
            vec!["namespace 42 via 172.17.0.4 (mark 0x0000002a)"]
        );
    }

    #[test]
    fn test_all_candidates_offline_drops() {
        let (watcher, recorder) = watcher_on_node_a();
        let node_c = Ipv4Addr::new(172, 17, 0, 5);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1]);
        watcher.update_node_egress(node_c, Ipv4Addr::new(10, 131, 0, 1), &[IP2]);
        watcher.update_namespace_egress(42, &[IP1, IP2]);

        recorder.take();

        recorder.report(&watcher, NODE_B, true);
        assert_eq!(
            recorder.take(),
            vec!["namespace 42 via 172.17.0.5 (mark 0x0000002a)"]
        );

        recorder.report(&watcher, node_c, true);
        assert_eq!(recorder.take(), vec!["namespace 42 dropped"]);
    }

    #[test]
    fn test_reordering_requests_resyncs_namespace() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP2]);
        watcher.update_namespace_egress(42, &[IP1, IP2]);
        recorder.take();

        watcher.update_namespace_egress(42, &[IP2, IP1]);

        assert_eq!(
            recorder.take(),
            vec!["namespace 42 via 172.17.0.4 (mark 0x0000002a)"],
            "Pure reordering must change the preferred node"
        );
    }

    #[test]
    fn test_failed_claim_rolls_back_and_retries_on_next_event() {
        let (watcher, recorder) = watcher_on_node_a();
        *recorder.fail_address_add.lock().unwrap() = true;

        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);

        assert_eq!(watcher.assigned_node(IP1), None, "Failed claim rolls back");
        assert_eq!(recorder.take(), vec!["namespace 42 dropped"]);

        *recorder.fail_address_add.lock().unwrap() = false;
        watcher.update_namespace_egress(42, &[IP1]);

        assert_eq!(watcher.assigned_node(IP1), Some(NODE_A));
        assert_eq!(
            recorder.take(),
            vec![
                "addr add 172.17.0.100/16 dev eth0",
                "rules add 172.17.0.100 0x0000002a",
                "namespace 42 via 172.17.0.3 (mark 0x0000002a)",
            ]
        );
    }

    #[test]
    fn test_node_removal_unmonitors_and_unassigns() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        recorder.take();

        watcher.delete_node_egress(NODE_B);

        assert_eq!(watcher.assigned_node(IP1), None);
        assert_eq!(
            recorder.take(),
            vec!["unmonitor 172.17.0.4", "namespace 42 dropped"]
        );
        assert!(watcher.snapshot().nodes.is_empty());
    }

    #[test]
    fn test_liveness_event_for_unknown_node_unmonitors() {
        let (watcher, recorder) = watcher_on_node_a();

        watcher.update_node(NODE_B, true);

        assert_eq!(recorder.take(), vec!["unmonitor 172.17.0.4"]);
    }

    #[test]
    fn test_verdict_from_before_reregistration_is_ignored() {
        let (watcher, recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1]);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP2]);
        watcher.update_namespace_egress(42, &[IP2, IP1]);

        // Old probe loop already queued "offline" when the node went away
        watcher.delete_node_egress(NODE_B);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP2]);
        recorder.take();

        watcher.update_node(NODE_B, true);

        assert!(recorder.take().is_empty(), "Stale verdict must not fail over");
        assert!(watcher.snapshot().nodes.iter().all(|n| !n.offline));
        assert_eq!(watcher.assigned_node(IP2), Some(NODE_B));
    }

    #[test]
    fn test_unused_entries_are_reclaimed() {
        let (watcher, _recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP1]);
        watcher.update_namespace_egress(42, &[IP1]);
        assert_eq!(watcher.snapshot().egress_ips.len(), 1);

        watcher.update_namespace_egress(42, &[]);
        watcher.delete_node_egress(NODE_B);

        let snapshot = watcher.snapshot();
        assert!(snapshot.egress_ips.is_empty());
        assert!(snapshot.namespaces.is_empty());
    }

    #[test]
    fn test_assignment_invariants_hold() {
        let (watcher, _recorder) = watcher_on_node_a();
        watcher.update_node_egress(NODE_A, GATEWAY_A, &[IP1, CONFLICT_IP]);
        watcher.update_node_egress(NODE_B, GATEWAY_B, &[IP2, CONFLICT_IP]);
        watcher.update_namespace_egress(42, &[IP1, IP2]);
        watcher.update_namespace_egress(43, &[CONFLICT_IP]);
        watcher.update_namespace_egress(44, &[IP2]);

        for eg in watcher.snapshot().egress_ips {
            if let Some(node_ip) = eg.assigned_node_ip {
                assert_eq!(eg.nodes, vec![node_ip], "{} assigned to a non-sole node", eg.ip);
                assert_eq!(eg.namespaces.len(), 1, "{} assigned with ambiguous tenant", eg.ip);
            }
        }
        assert_eq!(watcher.assigned_node(IP1), Some(NODE_A));
        assert_eq!(watcher.assigned_node(IP2), None);
        assert_eq!(watcher.assigned_node(CONFLICT_IP), None);
    }

    #[test]
    fn test_namespace_mode_normal_for_unknown_namespace() {
        let index = EgressIndex::new();
        assert_eq!(namespace_egress_mode(&index, 42), EgressMode::Normal);
    }
}
