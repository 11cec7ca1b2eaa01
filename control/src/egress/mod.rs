//! Egress IP coordination
//!
//! `watcher` holds the reconciliation engine; `claims` and `liveness` are the
//! pieces it drives on the local node. Host programming sits behind the traits
//! in `adapters`.

pub mod adapters;
pub mod claims;
pub mod index;
pub mod liveness;
pub mod watcher;

use std::sync::{Mutex, MutexGuard};
use tracing::warn;

pub use adapters::{
    AddressManager, ClaimEvent, EgressLink, ForwardingProgrammer, LinkResolver, LivenessTracker,
    MarkRuleManager, NodeLivenessEvent,
};
pub use claims::LocalClaims;
pub use index::{EgressIndex, EgressIpInfo, NamespaceEgress, NodeEgress};
pub use liveness::{watch_liveness, LivenessMonitor, NodeProber, TcpProber};
pub use watcher::{namespace_egress_mode, EgressIpWatcher, EgressSnapshot};

/// Safe Mutex lock helper that recovers from poisoning
#[inline]
pub(crate) fn safe_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex poisoned, recovering (data is still valid)");
        poisoned.into_inner()
    })
}
