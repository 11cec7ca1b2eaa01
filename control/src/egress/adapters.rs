//! Side-effect interfaces consumed by the egress watcher
//!
//! The watcher never touches the host directly. Everything it does to the
//! kernel, the virtual switch or the liveness monitor goes through one of these
//! narrow traits, so the reconciliation logic is testable without privileges.

use crate::error::EgressError;
use common::{EgressMark, EgressMode, Vnid};
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// The local link egress IPs are added to, and the subnet it sits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressLink {
    pub name: String,
    pub network: Ipv4Net,
}

impl EgressLink {
    pub fn new(name: impl Into<String>, network: Ipv4Net) -> Self {
        Self {
            name: name.into(),
            network,
        }
    }
}

impl fmt::Display for EgressLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.network)
    }
}

/// Finds the egress-capable link for the local node IP
pub trait LinkResolver {
    fn resolve(&self, node_ip: Ipv4Addr) -> Result<EgressLink, EgressError>;
}

/// Adds and removes secondary addresses
///
/// Both operations must be idempotent: "already present" on add and
/// "already absent" on delete are success.
pub trait AddressManager: Send + Sync {
    fn add_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError>;
    fn delete_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError>;
}

/// Installs and removes the rules that SNAT marked traffic to an egress IP
///
/// Idempotent in both directions.
pub trait MarkRuleManager: Send + Sync {
    fn add_egress_ip_rules(&self, egress_ip: Ipv4Addr, mark: EgressMark)
        -> Result<(), EgressError>;
    fn delete_egress_ip_rules(
        &self,
        egress_ip: Ipv4Addr,
        mark: EgressMark,
    ) -> Result<(), EgressError>;
}

/// Programs the virtual switch with a tenant's egress mode
pub trait ForwardingProgrammer: Send + Sync {
    fn set_namespace_egress(&self, vnid: Vnid, mode: &EgressMode) -> Result<(), EgressError>;
}

/// Node registration side of the liveness monitor
pub trait LivenessTracker: Send + Sync {
    fn add_node(&self, node_ip: Ipv4Addr, gateway_ip: Ipv4Addr);
    fn remove_node(&self, node_ip: Ipv4Addr);
    /// Current verdict for a tracked node (false if untracked)
    fn is_offline(&self, node_ip: Ipv4Addr) -> bool;
}

/// Human-readable record of a local claim, emitted instead of kernel changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimEvent {
    Claim(Ipv4Addr),
    Release(Ipv4Addr),
}

impl fmt::Display for ClaimEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimEvent::Claim(ip) => write!(f, "claim {}", ip),
            ClaimEvent::Release(ip) => write!(f, "release {}", ip),
        }
    }
}

/// Online/offline verdict for a node, emitted by the liveness monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLivenessEvent {
    pub node_ip: Ipv4Addr,
    pub offline: bool,
}
