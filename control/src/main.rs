use anyhow::{Context, Result};
use egress_control::apis::metrics::EGRESS_METRICS_REGISTRY;
use egress_control::apis::network::{watch_host_subnets, watch_net_namespaces};
use egress_control::config::AgentConfig;
use egress_control::egress::{
    watch_liveness, EgressIpWatcher, ForwardingProgrammer, LinkResolver, LivenessMonitor,
    LocalClaims, TcpProber,
};
use egress_control::host::{
    CommandRunner, IpAddressManager, IpLinkResolver, IptablesMarkRules, LoggingProgrammer,
    OvsFlowProgrammer, SystemRunner,
};
use egress_control::server::serve_admin;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Egress IP agent
///
/// Runs on every node: watches HostSubnets and NetNamespaces, hosts the
/// egress IPs assigned to this node, and steers each tenant's traffic.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;
    let node_ip = config
        .node_ip
        .context("EGRESS_NODE_IP must be set to this node's HostSubnet hostIP")?;

    info!(
        node = %node_ip,
        masquerade_bit = ?config.masquerade_bit,
        dry_run = config.dry_run,
        liveness = config.liveness.enabled,
        "Starting egress IP agent"
    );

    let mut handles = vec![];

    let (claims, forwarding) = if config.dry_run {
        dry_run_adapters(&mut handles)
    } else {
        host_adapters(&config, node_ip).await?
    };

    let mut watcher =
        EgressIpWatcher::new(node_ip, config.masquerade_mask(), claims, forwarding);

    let liveness_events = if config.liveness.enabled {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = LivenessMonitor::new(
            config.liveness.clone(),
            Arc::new(TcpProber::new(config.liveness.probe_port)),
            tx,
            &EGRESS_METRICS_REGISTRY,
        )
        .context("Failed to register liveness metrics")?;
        watcher = watcher.with_liveness(Arc::new(monitor));
        Some(rx)
    } else {
        None
    };

    let egress = Arc::new(watcher);

    if let Some(rx) = liveness_events {
        handles.push(tokio::spawn(watch_liveness(egress.clone(), rx)));
    }

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let hs_client = client.clone();
    let hs_egress = egress.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_host_subnets(hs_client, hs_egress).await {
            error!("HostSubnet watcher error: {}", e);
        }
    }));

    let nn_egress = egress.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = watch_net_namespaces(client, nn_egress).await {
            error!("NetNamespace watcher error: {}", e);
        }
    }));

    let listener = TcpListener::bind(&config.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind admin endpoint {}", config.metrics_addr))?;

    info!("Press Ctrl-C to exit.");

    tokio::select! {
        result = serve_admin(listener, egress) => {
            if let Err(e) = result {
                error!("Admin endpoint error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    // Cleanup: abort watcher tasks
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

/// Log claims and forwarding changes without touching the host
fn dry_run_adapters(
    handles: &mut Vec<tokio::task::JoinHandle<()>>,
) -> (LocalClaims, Arc<dyn ForwardingProgrammer>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    handles.push(tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(event = %event, "Local claim (dry run)");
        }
    }));
    (LocalClaims::Recording(tx), Arc::new(LoggingProgrammer))
}

/// Program the host with ip, iptables and ovs-ofctl
async fn host_adapters(
    config: &AgentConfig,
    node_ip: Ipv4Addr,
) -> Result<(LocalClaims, Arc<dyn ForwardingProgrammer>)> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let resolver = IpLinkResolver::new(runner.clone());
    let link = tokio::task::spawn_blocking(move || resolver.resolve(node_ip))
        .await
        .context("Egress link lookup panicked")?;

    let claims = match link {
        Ok(link) => {
            info!(link = %link, "Resolved egress link");
            LocalClaims::kernel(
                link,
                Arc::new(IpAddressManager::new(runner.clone())),
                Arc::new(IptablesMarkRules::new(
                    runner.clone(),
                    config.cluster_network_cidrs.clone(),
                )),
            )
        }
        Err(e) => {
            // Still useful: remote egress IPs can be routed to
            warn!(error = %e, "No egress link, this node cannot host egress IPs");
            LocalClaims::Unavailable
        }
    };

    let forwarding = Arc::new(OvsFlowProgrammer::new(
        runner,
        config.ovs_bridge.clone(),
        node_ip,
    ));
    Ok((claims, forwarding))
}
