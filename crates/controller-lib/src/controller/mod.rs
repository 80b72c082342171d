//! Node and pod cost controllers
//!
//! Each controller runs one reconciliation cycle for one object identity and
//! reports a [`Reconciled`](crate::reconcile::Reconciled) outcome. Scheduling
//! of cycles is left to [`crate::runtime`].

mod node;
mod owner;
mod pod;

#[cfg(test)]
mod tests;

pub use node::{NodeController, NodeCycle};
pub use owner::{is_aggregator, resolve_owner, DisplayOwner};
pub use pod::{PodController, PodCost, PodCycle};

use crate::annotations::AnnotationKeys;
use crate::models::NodeInfo;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between two price refreshes of one node
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
/// Fixed delay for transient retries
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by both controllers
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub refresh_interval: Duration,
    pub requeue_delay: Duration,
    /// Deadline for every store and provider call
    pub call_timeout: Duration,
    pub keys: AnnotationKeys,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            keys: AnnotationKeys::default(),
        }
    }
}

/// Static node info resolved by a provider, keyed by node name
///
/// Entries are dropped whenever the node's price is refreshed or the node
/// goes away, so a hit always matches the persisted price.
#[derive(Debug, Clone, Default)]
pub struct NodeInfoCache {
    entries: Arc<DashMap<String, NodeInfo>>,
}

impl NodeInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &str) -> Option<NodeInfo> {
        self.entries.get(node).map(|e| e.clone())
    }

    pub fn insert(&self, node: &str, info: NodeInfo) {
        self.entries.insert(node.to_string(), info);
    }

    pub fn invalidate(&self, node: &str) {
        self.entries.remove(node);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
