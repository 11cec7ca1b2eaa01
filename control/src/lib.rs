//! Egress IP Control Library
//!
//! Coordinates which node hosts each egress IP, claims the ones assigned to
//! this node, and programs per-tenant forwarding toward the owning node.

pub mod apis;
pub mod config;
pub mod egress;
pub mod error;
pub mod host;
pub mod server;
