use common::Vnid;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Egress coordinator errors
///
/// None of these are fatal: conflicts leave a binding inactive, local claim
/// failures roll the assignment back, malformed upstream data skips one update.
#[derive(Error, Debug)]
pub enum EgressError {
    #[error("multiple nodes ({first}, {second}) claiming egress IP {ip}")]
    MultipleNodes {
        ip: Ipv4Addr,
        first: Ipv4Addr,
        second: Ipv4Addr,
    },

    #[error("multiple namespaces ({first}, {second}) claiming egress IP {ip}")]
    MultipleNamespaces { ip: Ipv4Addr, first: Vnid, second: Vnid },

    #[error("multiple egress IPs ({ip}, {other}) for VNID {vnid} on node {node}")]
    NodeDoubleBooked {
        ip: Ipv4Addr,
        other: Ipv4Addr,
        vnid: Vnid,
        node: Ipv4Addr,
    },

    #[error("desired egress IP {0} is the node IP")]
    EgressIpIsNodeIp(Ipv4Addr),

    #[error("egress IP {ip} is not in local network {network} of interface {link}")]
    NotInLocalNetwork {
        ip: Ipv4Addr,
        network: ipnet::Ipv4Net,
        link: String,
    },

    #[error("no egress-capable link resolved for the local node")]
    NoEgressLink,

    #[error("could not parse {what} {value:?}")]
    MalformedResource { what: &'static str, value: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl EgressError {
    /// Conflict class for metrics labels, or `None` if this isn't a conflict
    pub fn conflict_kind(&self) -> Option<&'static str> {
        match self {
            EgressError::MultipleNodes { .. } => Some("multiple_nodes"),
            EgressError::MultipleNamespaces { .. } => Some("multiple_namespaces"),
            EgressError::NodeDoubleBooked { .. } => Some("node_double_booked"),
            _ => None,
        }
    }

    #[inline]
    pub fn is_conflict(&self) -> bool {
        self.conflict_kind().is_some()
    }
}

/// Failures running host networking commands (ip, iptables, ovs-ofctl)
#[derive(Error, Debug)]
pub enum HostError {
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("could not parse output of `{command}`: {reason}")]
    UnexpectedOutput { command: String, reason: String },
}
