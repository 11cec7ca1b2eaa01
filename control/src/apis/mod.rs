//! Kubernetes API integrations
//!
//! Watchers for the OpenShift SDN network resources, plus agent metrics.

pub mod metrics;
pub mod network;
