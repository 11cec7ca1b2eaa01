//! Configuration for the egress agent
//!
//! Defaults come from serde default functions; `from_env` overlays the
//! `EGRESS_*` environment variables on top.

use crate::error::EgressError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// This node's IP (the address its HostSubnet is keyed by)
    pub node_ip: Option<Ipv4Addr>,

    /// Masquerade bit index reserved by the SDN (default: 0)
    #[serde(default = "default_masquerade_bit")]
    pub masquerade_bit: Option<u8>,

    /// OVS bridge carrying pod traffic (default: br0)
    #[serde(default = "default_ovs_bridge")]
    pub ovs_bridge: String,

    /// Cluster pod network CIDRs, used as SNAT sources
    #[serde(default)]
    pub cluster_network_cidrs: Vec<Ipv4Net>,

    /// Bind address for /metrics, /healthz and /debug/egress
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Record claims and log forwarding changes instead of touching the host
    #[serde(default)]
    pub dry_run: bool,

    /// Node liveness probing
    #[serde(default)]
    pub liveness: LivenessConfig,
}

/// Liveness probing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LivenessConfig {
    /// Probe egress nodes and fail over when they go offline (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe interval in seconds (default: 5s)
    #[serde(default = "default_liveness_interval")]
    pub interval_secs: u64,

    /// Probe timeout in seconds (default: 2s)
    #[serde(default = "default_liveness_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures before a node is offline (default: 3)
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,

    /// Consecutive successes before an offline node is online again (default: 1)
    #[serde(default = "default_online_threshold")]
    pub online_threshold: u32,

    /// TCP port probed on each node (default: 10250, kubelet)
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
}

fn default_true() -> bool {
    true
}

fn default_masquerade_bit() -> Option<u8> {
    Some(0)
}

fn default_ovs_bridge() -> String {
    "br0".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9102".to_string()
}

fn default_liveness_interval() -> u64 {
    5
}

fn default_liveness_timeout() -> u64 {
    2
}

fn default_offline_threshold() -> u32 {
    3
}

fn default_online_threshold() -> u32 {
    1
}

fn default_probe_port() -> u16 {
    10250
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_liveness_interval(),
            timeout_secs: default_liveness_timeout(),
            offline_threshold: default_offline_threshold(),
            online_threshold: default_online_threshold(),
            probe_port: default_probe_port(),
        }
    }
}

impl LivenessConfig {
    /// Probe interval, never zero
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_ip: None,
            masquerade_bit: default_masquerade_bit(),
            ovs_bridge: default_ovs_bridge(),
            cluster_network_cidrs: Vec::new(),
            metrics_addr: default_metrics_addr(),
            dry_run: false,
            liveness: LivenessConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, EgressError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Split out of `from_env` so tests don't have to mutate the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EgressError> {
        let mut config = Self::default();

        if let Some(val) = lookup("EGRESS_NODE_IP") {
            config.node_ip = Some(parse_value("EGRESS_NODE_IP", &val)?);
        }

        if let Some(val) = lookup("EGRESS_MASQUERADE_BIT") {
            config.masquerade_bit = if val.is_empty() {
                None
            } else {
                let bit: u8 = parse_value("EGRESS_MASQUERADE_BIT", &val)?;
                if bit > 31 {
                    return Err(EgressError::Config(format!(
                        "EGRESS_MASQUERADE_BIT must be 0-31, got {}",
                        bit
                    )));
                }
                Some(bit)
            };
        }

        if let Some(val) = lookup("EGRESS_OVS_BRIDGE") {
            config.ovs_bridge = val;
        }

        if let Some(val) = lookup("EGRESS_CLUSTER_NETWORK_CIDRS") {
            config.cluster_network_cidrs = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_value("EGRESS_CLUSTER_NETWORK_CIDRS", s))
                .collect::<Result<_, _>>()?;
        }

        if let Some(val) = lookup("EGRESS_METRICS_ADDR") {
            config.metrics_addr = val;
        }

        if let Some(val) = lookup("EGRESS_DRY_RUN") {
            config.dry_run = parse_value("EGRESS_DRY_RUN", &val)?;
        }

        if let Some(val) = lookup("EGRESS_LIVENESS_ENABLED") {
            config.liveness.enabled = parse_value("EGRESS_LIVENESS_ENABLED", &val)?;
        }

        if let Some(val) = lookup("EGRESS_LIVENESS_PORT") {
            config.liveness.probe_port = parse_value("EGRESS_LIVENESS_PORT", &val)?;
        }

        Ok(config)
    }

    /// Masquerade bit as a mask (0 when unset)
    pub fn masquerade_mask(&self) -> u32 {
        self.masquerade_bit
            .and_then(common::masquerade_bit_mask)
            .unwrap_or(0)
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, EgressError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EgressError::Config(format!("invalid {} {:?}: {}", key, value, e)))
}
