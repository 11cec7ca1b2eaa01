//! Egress agent metrics
//!
//! Process-wide metrics live in `EGRESS_METRICS_REGISTRY`. Components that own
//! their metrics (the liveness monitor) register into the same registry so one
//! `/metrics` endpoint serves everything.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Agent metrics registry
    pub static ref EGRESS_METRICS_REGISTRY: Registry = Registry::new();

    /// Duration of one reconciliation pass
    static ref EGRESS_SYNC_DURATION: Histogram = {
        let opts = HistogramOpts::new(
            "egress_sync_duration_seconds",
            "Egress IP reconciliation pass duration in seconds",
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]);
        let histogram = Histogram::with_opts(opts).expect("Failed to create histogram");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Items visited by reconciliation passes
    static ref EGRESS_SYNC_ITEMS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "egress_sync_items_total",
            "Egress IPs and namespaces re-evaluated by reconciliation passes",
        );
        let counter = IntCounterVec::new(opts, &["kind"]).expect("Failed to create counter");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Egress IPs left unassigned because of conflicting claims
    static ref EGRESS_CONFLICTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "egress_ip_conflicts_total",
            "Egress IP evaluations that found conflicting claims",
        );
        let counter = IntCounterVec::new(opts, &["kind"]).expect("Failed to create counter");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Local claim/release attempts
    static ref EGRESS_LOCAL_CLAIMS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "egress_local_claims_total",
            "Local egress IP claim and release attempts",
        );
        let counter = IntCounterVec::new(opts, &["op", "result"])
            .expect("Failed to create counter");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Namespace forwarding updates
    static ref EGRESS_NAMESPACE_UPDATES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "egress_namespace_updates_total",
            "Namespace egress forwarding updates by resulting mode",
        );
        let counter = IntCounterVec::new(opts, &["mode", "result"])
            .expect("Failed to create counter");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Watch events received from the API server
    static ref EGRESS_WATCH_EVENTS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "egress_watch_events_total",
            "Watch events received per resource",
        );
        let counter = IntCounterVec::new(opts, &["resource", "event"])
            .expect("Failed to create counter");
        EGRESS_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "error"
    }
}

/// Record one reconciliation pass
pub fn record_sync_pass(changed_ips: usize, changed_namespaces: usize, duration_secs: f64) {
    EGRESS_SYNC_DURATION.observe(duration_secs);
    EGRESS_SYNC_ITEMS_TOTAL
        .with_label_values(&["egress_ip"])
        .inc_by(changed_ips as u64);
    EGRESS_SYNC_ITEMS_TOTAL
        .with_label_values(&["namespace"])
        .inc_by(changed_namespaces as u64);
}

/// Record a conflicting-claims evaluation
pub fn record_conflict(kind: &str) {
    EGRESS_CONFLICTS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a local claim ("claim") or release ("release")
pub fn record_local_claim(op: &str, ok: bool) {
    EGRESS_LOCAL_CLAIMS_TOTAL
        .with_label_values(&[op, result_label(ok)])
        .inc();
}

/// Record a namespace forwarding update
pub fn record_namespace_egress(mode: &str, ok: bool) {
    EGRESS_NAMESPACE_UPDATES_TOTAL
        .with_label_values(&[mode, result_label(ok)])
        .inc();
}

/// Record a watch event ("apply", "delete", "init", "init_done", "error")
pub fn record_watch_event(resource: &str, event: &str) {
    EGRESS_WATCH_EVENTS_TOTAL
        .with_label_values(&[resource, event])
        .inc();
}

/// Gather agent metrics in the Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = EGRESS_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_recorded_metrics() {
        record_sync_pass(2, 1, 0.001);
        record_conflict("multiple_nodes");
        record_local_claim("claim", true);
        record_namespace_egress("dropped", true);
        record_watch_event("hostsubnet", "apply");

        let text = gather_metrics().expect("Metrics should encode");

        assert!(text.contains("egress_sync_duration_seconds"));
        assert!(text.contains("egress_ip_conflicts_total{kind=\"multiple_nodes\"}"));
        assert!(text.contains("egress_local_claims_total{op=\"claim\",result=\"success\"}"));
        assert!(text.contains("egress_namespace_updates_total"));
        assert!(text.contains("egress_watch_events_total"));
    }
}
