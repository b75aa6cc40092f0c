//! Cluster integration hooks.
//!
//! The engine itself knows nothing about replication; it only consults
//! these callbacks at its mutation points. Absent a cluster layer the
//! hooks are simply not installed.

use std::sync::Arc;

use crate::core::message::Message;

pub trait ClusterSafety: Send + Sync {
    /// Predicate asserted by mutating queue operations.
    fn is_safe(&self) -> bool {
        true
    }

    /// Returning true tells the queue to drop the delivery; the cluster
    /// layer will re-drive it on every member.
    fn defer_delivery(&self, _queue: &str, _message: &Arc<Message>) -> bool {
        false
    }
}
