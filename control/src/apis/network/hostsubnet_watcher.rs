//! HostSubnet watcher
//!
//! Feeds each node's egress IP offer into the egress watcher.
//!
//! ## How It Works
//!
//! 1. Watch all HostSubnets (cluster-scoped)
//! 2. Apply: parse hostIP, subnet and egressIPs; a malformed object is skipped
//!    whole, leaving the node's previous offer in place
//! 3. Delete: the node stops offering anything
//! 4. Re-list: nodes whose HostSubnet vanished while the watch was down are
//!    removed at `InitDone`

use super::{run_blocking, HostSubnet, NodeEgressUpdate, RelistTracker};
use crate::apis::metrics::record_watch_event;
use crate::egress::EgressIpWatcher;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, ResourceExt};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESOURCE: &str = "hostsubnet";

/// Change to apply to the egress watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    Update(NodeEgressUpdate),
    Delete(Ipv4Addr),
}

impl NodeAction {
    pub fn apply(self, egress: &EgressIpWatcher) {
        match self {
            NodeAction::Update(update) => {
                egress.update_node_egress(update.node_ip, update.gateway_ip, &update.egress_ips)
            }
            NodeAction::Delete(node_ip) => egress.delete_node_egress(node_ip),
        }
    }
}

/// Turns HostSubnet watch events into node actions
#[derive(Debug, Default)]
pub struct HostSubnetHandler {
    tracker: RelistTracker<Ipv4Addr>,
}

impl HostSubnetHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: watcher::Event<HostSubnet>) -> Vec<NodeAction> {
        match event {
            watcher::Event::Apply(hs) | watcher::Event::InitApply(hs) => {
                record_watch_event(RESOURCE, "apply");
                self.on_apply(&hs)
            }
            watcher::Event::Delete(hs) => {
                record_watch_event(RESOURCE, "delete");
                self.on_delete(&hs)
            }
            watcher::Event::Init => {
                record_watch_event(RESOURCE, "init");
                debug!("HostSubnet watcher (re)listing");
                self.tracker.begin();
                Vec::new()
            }
            watcher::Event::InitDone => {
                record_watch_event(RESOURCE, "init_done");
                let gone = self.tracker.finish();
                info!(
                    nodes = self.tracker.len(),
                    vanished = gone.len(),
                    "HostSubnet watcher initial sync complete"
                );
                gone.into_iter().map(NodeAction::Delete).collect()
            }
        }
    }

    fn on_apply(&mut self, hs: &HostSubnet) -> Vec<NodeAction> {
        let name = hs.name_any();
        let update = match hs.egress_update() {
            Ok(update) => update,
            Err(e) => {
                warn!(hostsubnet = %name, error = %e, "Ignoring malformed HostSubnet");
                self.tracker.touch(&name);
                return Vec::new();
            }
        };
        debug!(
            hostsubnet = %name,
            node = %update.node_ip,
            egress_ips = update.egress_ips.len(),
            "HostSubnet applied"
        );

        let mut actions = Vec::new();
        if let Some(old_ip) = self.tracker.applied(&name, update.node_ip) {
            // hostIP changed: the old node IP no longer offers anything
            actions.push(NodeAction::Delete(old_ip));
        }
        actions.push(NodeAction::Update(update));
        actions
    }

    fn on_delete(&mut self, hs: &HostSubnet) -> Vec<NodeAction> {
        let name = hs.name_any();
        match self.tracker.deleted(&name).map(Ok).unwrap_or_else(|| hs.node_ip()) {
            Ok(node_ip) => {
                debug!(hostsubnet = %name, node = %node_ip, "HostSubnet deleted");
                vec![NodeAction::Delete(node_ip)]
            }
            Err(e) => {
                warn!(hostsubnet = %name, error = %e, "Cannot resolve deleted HostSubnet");
                Vec::new()
            }
        }
    }
}

/// Watch HostSubnets and apply them to the egress watcher
pub async fn watch_host_subnets(
    client: Client,
    egress: Arc<EgressIpWatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let api: Api<HostSubnet> = Api::all(client);
    let watcher = watcher(api, WatcherConfig::default());

    futures::pin_mut!(watcher);

    info!("Starting HostSubnet watcher");

    let mut handler = HostSubnetHandler::new();

    while let Some(event) = watcher.next().await {
        match event {
            Ok(event) => {
                let actions = handler.on_event(event);
                if actions.is_empty() {
                    continue;
                }
                run_blocking(&egress, move |egress| {
                    for action in actions {
                        action.apply(egress);
                    }
                })
                .await;
            }
            Err(e) => {
                record_watch_event(RESOURCE, "error");
                warn!("HostSubnet watcher error: {}", e);
            }
        }
    }

    Ok(())
}
