//! OpenShift SDN network resources (network.openshift.io/v1)
//!
//! `HostSubnet` carries a node's egress IP offer, `NetNamespace` a tenant's
//! ordered egress IP request. Both are cluster-scoped and keep their fields at
//! the top level rather than under `spec`, so `kube::Resource` is implemented
//! by hand.

pub mod hostsubnet_watcher;
pub mod netnamespace_watcher;

use crate::egress::EgressIpWatcher;
use crate::error::EgressError;
use common::{Vnid, MAX_VNID};
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::warn;

pub use hostsubnet_watcher::watch_host_subnets;
pub use netnamespace_watcher::watch_net_namespaces;

const GROUP: &str = "network.openshift.io";
const VERSION: &str = "v1";

/// A node's pod subnet and egress IP offer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct HostSubnet {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub host: String,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(rename = "egressIPs", default)]
    pub egress_ips: Vec<String>,
}

impl Resource for HostSubnet {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "HostSubnet".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "hostsubnets".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A tenant's network ID and egress IP request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetNamespace {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub netname: String,
    #[serde(default)]
    pub netid: u32,
    #[serde(rename = "egressIPs", default)]
    pub egress_ips: Vec<String>,
}

impl Resource for NetNamespace {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "NetNamespace".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "netnamespaces".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Parsed egress view of a `HostSubnet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEgressUpdate {
    pub node_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub egress_ips: Vec<Ipv4Addr>,
}

/// Parsed egress view of a `NetNamespace`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEgressUpdate {
    pub vnid: Vnid,
    pub egress_ips: Vec<Ipv4Addr>,
}

fn parse_ip(what: &'static str, value: &str) -> Result<Ipv4Addr, EgressError> {
    value.trim().parse().map_err(|_| EgressError::MalformedResource {
        what,
        value: value.to_string(),
    })
}

fn parse_egress_ips(values: &[String]) -> Result<Vec<Ipv4Addr>, EgressError> {
    values.iter().map(|v| parse_ip("egress IP", v)).collect()
}

/// Node gateway: first address of the node's pod subnet
pub fn default_gateway(subnet: Ipv4Net) -> Option<Ipv4Addr> {
    u32::from(subnet.network())
        .checked_add(1)
        .map(Ipv4Addr::from)
}

impl HostSubnet {
    pub fn node_ip(&self) -> Result<Ipv4Addr, EgressError> {
        parse_ip("HostSubnet hostIP", &self.host_ip)
    }

    /// Everything the egress watcher needs from this object
    ///
    /// Any malformed field rejects the whole update.
    pub fn egress_update(&self) -> Result<NodeEgressUpdate, EgressError> {
        let node_ip = self.node_ip()?;
        let subnet: Ipv4Net =
            self.subnet
                .trim()
                .parse()
                .map_err(|_| EgressError::MalformedResource {
                    what: "HostSubnet subnet",
                    value: self.subnet.clone(),
                })?;
        let gateway_ip =
            default_gateway(subnet).ok_or_else(|| EgressError::MalformedResource {
                what: "HostSubnet subnet",
                value: self.subnet.clone(),
            })?;

        Ok(NodeEgressUpdate {
            node_ip,
            gateway_ip,
            egress_ips: parse_egress_ips(&self.egress_ips)?,
        })
    }
}

impl NetNamespace {
    pub fn vnid(&self) -> Result<Vnid, EgressError> {
        if self.netid > MAX_VNID {
            return Err(EgressError::MalformedResource {
                what: "NetNamespace netid",
                value: self.netid.to_string(),
            });
        }
        Ok(self.netid)
    }

    pub fn egress_update(&self) -> Result<NamespaceEgressUpdate, EgressError> {
        Ok(NamespaceEgressUpdate {
            vnid: self.vnid()?,
            egress_ips: parse_egress_ips(&self.egress_ips)?,
        })
    }
}

/// Tracks object name → watcher key across watch restarts
///
/// A re-list (`Init` … `InitDone`) replays every live object but says nothing
/// about objects deleted while the watch was down. Anything known before
/// `Init` and not replayed by `InitDone` is reported as deleted.
#[derive(Debug)]
pub struct RelistTracker<K> {
    known: BTreeMap<String, K>,
    relisted: Option<BTreeSet<String>>,
}

impl<K> Default for RelistTracker<K> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relisted: None,
        }
    }
}

impl<K: Clone + PartialEq> RelistTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A re-list is starting
    pub fn begin(&mut self) {
        self.relisted = Some(BTreeSet::new());
    }

    /// Object applied; returns the key it previously mapped to, if different
    pub fn applied(&mut self, name: &str, key: K) -> Option<K> {
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(name.to_string());
        }
        match self.known.insert(name.to_string(), key.clone()) {
            Some(old) if old != key => Some(old),
            _ => None,
        }
    }

    /// Object replayed but not applied (malformed); keep it out of `finish`
    pub fn touch(&mut self, name: &str) {
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(name.to_string());
        }
    }

    /// Object deleted; returns the key it mapped to
    pub fn deleted(&mut self, name: &str) -> Option<K> {
        self.known.remove(name)
    }

    /// Re-list finished; returns keys of objects that vanished meanwhile
    pub fn finish(&mut self) -> Vec<K> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };
        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        gone.iter().filter_map(|name| self.known.remove(name)).collect()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Run watcher mutations off the async runtime
///
/// The egress watcher holds a blocking lock and may shell out, so it never
/// runs on a runtime worker.
pub(crate) async fn run_blocking<F>(egress: &Arc<EgressIpWatcher>, f: F)
where
    F: FnOnce(&EgressIpWatcher) + Send + 'static,
{
    let egress = egress.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || f(&egress)).await {
        warn!(error = %e, "Egress watcher update panicked");
    }
}
