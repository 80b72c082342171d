//! Maps store change notifications to queued cycles
//!
//! Pods are re-run when their bound node's cached cost changes. The set of
//! affected pods comes from the store's node-binding index, so one node
//! change costs one lookup scoped to that node.

use super::WorkQueue;
use crate::annotations::{AnnotationKeys, CostCacheEntry};
use crate::models::{NodeRecord, ObjectKey};
use crate::reconcile::bounded;
use crate::store::{ChangeEvent, ObjectStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

type Fingerprint = (Option<String>, Option<String>);

pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue>,
    keys: AnnotationKeys,
    call_timeout: Duration,
    /// Last cost fingerprint seen per node
    fingerprints: DashMap<String, Fingerprint>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<WorkQueue>,
        keys: AnnotationKeys,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            keys,
            call_timeout,
            fingerprints: DashMap::new(),
        }
    }

    /// Consume change notifications until shutdown
    pub async fn run(
        self,
        mut changes: broadcast::Receiver<ChangeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting change dispatcher");
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        // Next node events re-trigger their pods
                        warn!(missed = missed, "Change dispatcher fell behind");
                        self.fingerprints.clear();
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change stream closed");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down change dispatcher");
                    break;
                }
            }
        }
    }

    pub async fn handle(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Node(node) => {
                self.queue.add(ObjectKey::Node(node.name.clone())).await;
                if self.cost_changed(&node) {
                    self.enqueue_bound_pods(&node.name).await;
                }
            }
            ChangeEvent::NodeDeleted(name) => {
                self.fingerprints.remove(&name);
                self.queue.add(ObjectKey::Node(name.clone())).await;
                self.enqueue_bound_pods(&name).await;
            }
            ChangeEvent::Pod(key) | ChangeEvent::PodDeleted(key) => {
                self.queue.add(ObjectKey::Pod(key)).await;
            }
            ChangeEvent::Resync => {
                debug!("Watch restarted, forgetting cost fingerprints");
                self.fingerprints.clear();
            }
        }
    }

    /// Record the node's fingerprint; true if it differs from the last one seen
    fn cost_changed(&self, node: &NodeRecord) -> bool {
        let current = CostCacheEntry::fingerprint(node, &self.keys);
        match self.fingerprints.insert(node.name.clone(), current.clone()) {
            Some(previous) => previous != current,
            None => true,
        }
    }

    async fn enqueue_bound_pods(&self, node: &str) {
        match bounded(self.call_timeout, self.store.pods_on_node(node)).await {
            Ok(pods) => {
                debug!(node = %node, pods = pods.len(), "Node cost changed, requeueing bound pods");
                for pod in pods {
                    self.queue.add(ObjectKey::Pod(pod)).await;
                }
            }
            Err(e) => warn!(node = %node, error = %e, "Failed to list pods bound to node"),
        }
    }
}
