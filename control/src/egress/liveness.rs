//! Egress node liveness monitoring
//!
//! Probes every remote egress node on a fixed interval and reports
//! online/offline transitions on a channel. `watch_liveness` feeds those
//! transitions back into the watcher, which fails tenants over to their next
//! egress IP.
//!
//! Metrics are injected via a `Registry`, not global.

use super::adapters::{LivenessTracker, NodeLivenessEvent};
use super::safe_lock;
use super::watcher::EgressIpWatcher;
use crate::config::LivenessConfig;
use async_trait::async_trait;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Checks whether a node is reachable
#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn probe(&self, node_ip: Ipv4Addr, gateway_ip: Ipv4Addr) -> io::Result<()>;
}

/// Probes a node by opening a TCP connection to a well-known port
#[derive(Debug, Clone)]
pub struct TcpProber {
    port: u16,
}

impl TcpProber {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl NodeProber for TcpProber {
    async fn probe(&self, node_ip: Ipv4Addr, _gateway_ip: Ipv4Addr) -> io::Result<()> {
        TcpStream::connect(SocketAddr::from((node_ip, self.port)))
            .await
            .map(|_| ())
    }
}

/// Probe bookkeeping for one node
#[derive(Debug, Clone)]
struct NodeLivenessState {
    gateway_ip: Ipv4Addr,
    offline: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl NodeLivenessState {
    fn new(gateway_ip: Ipv4Addr) -> Self {
        Self {
            gateway_ip,
            offline: false,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    /// Returns true if the node just came back online
    fn record_success(&mut self, config: &LivenessConfig) -> bool {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        if self.offline && self.consecutive_successes >= config.online_threshold {
            self.offline = false;
            return true;
        }
        false
    }

    /// Returns true if the node just went offline
    fn record_failure(&mut self, config: &LivenessConfig) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        if !self.offline && self.consecutive_failures >= config.offline_threshold {
            self.offline = true;
            return true;
        }
        false
    }
}

#[derive(Clone)]
struct LivenessMetrics {
    node_online: IntGaugeVec,
    probes_total: IntCounterVec,
    transitions_total: IntCounterVec,
}

impl LivenessMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let node_online = IntGaugeVec::new(
            Opts::new(
                "egress_node_online",
                "Egress node liveness (1=online, 0=offline)",
            ),
            &["node"],
        )?;
        let probes_total = IntCounterVec::new(
            Opts::new(
                "egress_liveness_probes_total",
                "Total number of egress node liveness probes",
            ),
            &["node", "result"], // result = success | failure | timeout
        )?;
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "egress_liveness_transitions_total",
                "Egress node online/offline transitions",
            ),
            &["node", "to"],
        )?;

        registry.register(Box::new(node_online.clone()))?;
        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;

        Ok(Self {
            node_online,
            probes_total,
            transitions_total,
        })
    }
}

type SharedStates = Arc<Mutex<HashMap<Ipv4Addr, NodeLivenessState>>>;

/// Liveness monitor for remote egress nodes
pub struct LivenessMonitor {
    config: LivenessConfig,
    prober: Arc<dyn NodeProber>,
    events: UnboundedSender<NodeLivenessEvent>,
    states: SharedStates,
    tasks: Mutex<HashMap<Ipv4Addr, JoinHandle<()>>>,
    runtime: Option<Handle>,
    metrics: LivenessMetrics,
}

impl LivenessMonitor {
    /// Create a monitor with metrics registered in the given registry
    ///
    /// Probe loops are only spawned when constructed inside a tokio runtime.
    pub fn new(
        config: LivenessConfig,
        prober: Arc<dyn NodeProber>,
        events: UnboundedSender<NodeLivenessEvent>,
        registry: &Registry,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            config,
            prober,
            events,
            states: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            runtime: Handle::try_current().ok(),
            metrics: LivenessMetrics::register(registry)?,
        })
    }

    /// Nodes currently being probed
    pub fn monitored_nodes(&self) -> Vec<Ipv4Addr> {
        let mut nodes: Vec<Ipv4Addr> = safe_lock(&self.states).keys().copied().collect();
        nodes.sort();
        nodes
    }

    async fn probe_loop(
        node_ip: Ipv4Addr,
        config: LivenessConfig,
        prober: Arc<dyn NodeProber>,
        events: UnboundedSender<NodeLivenessEvent>,
        states: SharedStates,
        metrics: LivenessMetrics,
    ) {
        let mut interval_timer = interval(config.interval());
        let node_label = node_ip.to_string();

        info!(node = %node_ip, "Starting egress node liveness probes");

        loop {
            interval_timer.tick().await;

            let Some(gateway_ip) = safe_lock(&states).get(&node_ip).map(|s| s.gateway_ip) else {
                debug!(node = %node_ip, "Node no longer monitored, stopping probes");
                return;
            };

            let result =
                tokio::time::timeout(config.timeout(), prober.probe(node_ip, gateway_ip)).await;

            let (probe_result, transition) = {
                let mut states = safe_lock(&states);
                let Some(state) = states.get_mut(&node_ip) else {
                    return;
                };
                let (probe_result, changed) = match result {
                    Ok(Ok(())) => ("success", state.record_success(&config)),
                    Ok(Err(e)) => {
                        debug!(
                            node = %node_ip,
                            error = %e,
                            consecutive_failures = state.consecutive_failures + 1,
                            "Liveness probe failed"
                        );
                        ("failure", state.record_failure(&config))
                    }
                    Err(_) => {
                        debug!(
                            node = %node_ip,
                            timeout_ms = config.timeout().as_millis() as u64,
                            "Liveness probe timed out"
                        );
                        ("timeout", state.record_failure(&config))
                    }
                };
                (probe_result, changed.then_some(state.offline))
            };

            metrics
                .probes_total
                .with_label_values(&[&node_label, probe_result])
                .inc();

            let Some(offline) = transition else {
                continue;
            };

            let to = if offline { "offline" } else { "online" };
            metrics
                .transitions_total
                .with_label_values(&[&node_label, to])
                .inc();
            metrics
                .node_online
                .with_label_values(&[&node_label])
                .set(if offline { 0 } else { 1 });

            if offline {
                warn!(node = %node_ip, "Egress node is offline");
            } else {
                info!(node = %node_ip, "Egress node is back online");
            }

            if events.send(NodeLivenessEvent { node_ip, offline }).is_err() {
                debug!(node = %node_ip, "Liveness receiver dropped, stopping probes");
                return;
            }
        }
    }
}

impl LivenessTracker for LivenessMonitor {
    fn add_node(&self, node_ip: Ipv4Addr, gateway_ip: Ipv4Addr) {
        {
            let mut states = safe_lock(&self.states);
            if states.contains_key(&node_ip) {
                return;
            }
            states.insert(node_ip, NodeLivenessState::new(gateway_ip));
        }
        self.metrics
            .node_online
            .with_label_values(&[&node_ip.to_string()])
            .set(1);

        // Only spawn if runtime is available (gracefully skip in tests)
        let Some(runtime) = &self.runtime else {
            return;
        };
        let handle = runtime.spawn(Self::probe_loop(
            node_ip,
            self.config.clone(),
            self.prober.clone(),
            self.events.clone(),
            self.states.clone(),
            self.metrics.clone(),
        ));
        safe_lock(&self.tasks).insert(node_ip, handle);
    }

    fn remove_node(&self, node_ip: Ipv4Addr) {
        let removed = safe_lock(&self.states).remove(&node_ip).is_some();
        if let Some(task) = safe_lock(&self.tasks).remove(&node_ip) {
            task.abort();
        }
        if removed {
            info!(node = %node_ip, "Stopped monitoring egress node");
            let _ = self
                .metrics
                .node_online
                .remove_label_values(&[&node_ip.to_string()]);
        }
    }

    fn is_offline(&self, node_ip: Ipv4Addr) -> bool {
        safe_lock(&self.states)
            .get(&node_ip)
            .is_some_and(|state| state.offline)
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        for (_, task) in safe_lock(&self.tasks).drain() {
            task.abort();
        }
    }
}

/// Apply liveness transitions to the watcher until the channel closes
pub async fn watch_liveness(
    watcher: Arc<EgressIpWatcher>,
    mut events: UnboundedReceiver<NodeLivenessEvent>,
) {
    while let Some(event) = events.recv().await {
        let watcher = watcher.clone();
        let result = tokio::task::spawn_blocking(move || {
            watcher.update_node(event.node_ip, event.offline);
        })
        .await;
        if let Err(e) = result {
            warn!(node = %event.node_ip, error = %e, "Liveness update panicked");
        }
    }
    debug!("Liveness event channel closed");
}
