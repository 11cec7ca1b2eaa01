//! NetNamespace watcher
//!
//! Feeds each tenant's ordered egress IP request into the egress watcher.
//! Deleting a NetNamespace, or emptying its egressIPs, restores normal egress.

use super::{run_blocking, NamespaceEgressUpdate, NetNamespace, RelistTracker};
use crate::apis::metrics::record_watch_event;
use crate::egress::EgressIpWatcher;
use common::Vnid;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESOURCE: &str = "netnamespace";

/// Change to apply to the egress watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceAction {
    Update(NamespaceEgressUpdate),
    Delete(Vnid),
}

impl NamespaceAction {
    pub fn apply(self, egress: &EgressIpWatcher) {
        match self {
            NamespaceAction::Update(update) => {
                egress.update_namespace_egress(update.vnid, &update.egress_ips)
            }
            NamespaceAction::Delete(vnid) => egress.delete_namespace_egress(vnid),
        }
    }
}

/// Turns NetNamespace watch events into namespace actions
#[derive(Debug, Default)]
pub struct NetNamespaceHandler {
    tracker: RelistTracker<Vnid>,
}

impl NetNamespaceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: watcher::Event<NetNamespace>) -> Vec<NamespaceAction> {
        match event {
            watcher::Event::Apply(netns) | watcher::Event::InitApply(netns) => {
                record_watch_event(RESOURCE, "apply");
                self.on_apply(&netns)
            }
            watcher::Event::Delete(netns) => {
                record_watch_event(RESOURCE, "delete");
                let name = netns.name_any();
                match self.tracker.deleted(&name).map(Ok).unwrap_or_else(|| netns.vnid()) {
                    Ok(vnid) => {
                        debug!(netnamespace = %name, vnid = vnid, "NetNamespace deleted");
                        vec![NamespaceAction::Delete(vnid)]
                    }
                    Err(e) => {
                        warn!(netnamespace = %name, error = %e, "Cannot resolve deleted NetNamespace");
                        Vec::new()
                    }
                }
            }
            watcher::Event::Init => {
                record_watch_event(RESOURCE, "init");
                self.tracker.begin();
                Vec::new()
            }
            watcher::Event::InitDone => {
                record_watch_event(RESOURCE, "init_done");
                let gone = self.tracker.finish();
                info!(
                    namespaces = self.tracker.len(),
                    vanished = gone.len(),
                    "NetNamespace watcher initial sync complete"
                );
                gone.into_iter().map(NamespaceAction::Delete).collect()
            }
        }
    }

    fn on_apply(&mut self, netns: &NetNamespace) -> Vec<NamespaceAction> {
        let name = netns.name_any();
        let update = match netns.egress_update() {
            Ok(update) => update,
            Err(e) => {
                warn!(netnamespace = %name, error = %e, "Ignoring malformed NetNamespace");
                self.tracker.touch(&name);
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        if let Some(old_vnid) = self.tracker.applied(&name, update.vnid) {
            actions.push(NamespaceAction::Delete(old_vnid));
        }
        actions.push(NamespaceAction::Update(update));
        actions
    }
}

/// Watch NetNamespaces and apply them to the egress watcher
pub async fn watch_net_namespaces(
    client: Client,
    egress: Arc<EgressIpWatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let api: Api<NetNamespace> = Api::all(client);
    let watcher = watcher(api, WatcherConfig::default());

    futures::pin_mut!(watcher);

    info!("Starting NetNamespace watcher");

    let mut handler = NetNamespaceHandler::new();

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
                warn!("NetNamespace watcher error: {}", e);
            }
        }
    }

    Ok(())
}
