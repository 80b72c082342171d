//! In-memory object store
//!
//! Assigns monotonically increasing versions, keeps the node-binding index
//! for pods and broadcasts a change event for every mutation. Tests use the
//! `modify_*` helpers to play the part of a concurrent external writer.

use super::{ChangeEvent, ObjectStore, UpdateOutcome, CHANGE_CHANNEL_CAPACITY};
use crate::error::StoreError;
use crate::models::{NodeRecord, OwnerRef, PodKey, PodRecord, Version};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Object key for owner lookups: (namespace, kind, name)
type OwnerKey = (String, String, String);

pub struct InMemoryStore {
    nodes: DashMap<String, NodeRecord>,
    pods: DashMap<PodKey, PodRecord>,
    /// node name -> pods bound to it
    by_node: DashMap<String, BTreeSet<PodKey>>,
    /// owner object -> its controlling owner
    controllers: DashMap<OwnerKey, OwnerRef>,
    next_version: AtomicU64,
    node_writes: AtomicUsize,
    fail_updates: AtomicBool,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            nodes: DashMap::new(),
            pods: DashMap::new(),
            by_node: DashMap::new(),
            controllers: DashMap::new(),
            next_version: AtomicU64::new(1),
            node_writes: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
            events,
        }
    }

    fn bump(&self) -> Version {
        Version(self.next_version.fetch_add(1, Ordering::SeqCst).to_string())
    }

    fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create or replace a node, assigning a fresh version
    pub fn put_node(&self, mut node: NodeRecord) -> Version {
        let version = self.bump();
        node.version = version.clone();
        self.nodes.insert(node.name.clone(), node.clone());
        self.emit(ChangeEvent::Node(node));
        version
    }

    /// Mutate a node the way another writer would
    pub fn modify_node(&self, name: &str, change: impl FnOnce(&mut NodeRecord)) -> Option<Version> {
        let updated = {
            let mut entry = self.nodes.get_mut(name)?;
            change(entry.value_mut());
            entry.version = self.bump();
            entry.clone()
        };
        let version = updated.version.clone();
        self.emit(ChangeEvent::Node(updated));
        Some(version)
    }

    pub fn delete_node(&self, name: &str) -> Option<NodeRecord> {
        let (_, node) = self.nodes.remove(name)?;
        self.emit(ChangeEvent::NodeDeleted(name.to_string()));
        Some(node)
    }

    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(name).map(|n| n.clone())
    }

    /// Create or replace a pod and keep the node-binding index current
    pub fn put_pod(&self, mut pod: PodRecord) -> Version {
        let version = self.bump();
        pod.version = version.clone();

        let previous = self.pods.insert(pod.key.clone(), pod.clone());
        if let Some(old_node) = previous.and_then(|p| p.node_name) {
            if pod.node_name.as_deref() != Some(old_node.as_str()) {
                self.unindex(&old_node, &pod.key);
            }
        }
        if let Some(node) = &pod.node_name {
            self.by_node
                .entry(node.clone())
                .or_default()
                .insert(pod.key.clone());
        }

        self.emit(ChangeEvent::Pod(pod.key));
        version
    }

    pub fn modify_pod(&self, key: &PodKey, change: impl FnOnce(&mut PodRecord)) -> Option<Version> {
        let mut pod = self.pods.get(key)?.clone();
        change(&mut pod);
        Some(self.put_pod(pod))
    }

    pub fn delete_pod(&self, key: &PodKey) -> Option<PodRecord> {
        let (_, pod) = self.pods.remove(key)?;
        if let Some(node) = &pod.node_name {
            self.unindex(node, key);
        }
        self.emit(ChangeEvent::PodDeleted(key.clone()));
        Some(pod)
    }

    fn unindex(&self, node: &str, key: &PodKey) {
        if let Some(mut bound) = self.by_node.get_mut(node) {
            bound.remove(key);
        }
        self.by_node.remove_if(node, |_, bound| bound.is_empty());
    }

    /// Record that `owner` in `namespace` is controlled by `controller`
    pub fn set_controller(&self, namespace: &str, owner: &OwnerRef, controller: OwnerRef) {
        self.controllers.insert(
            (namespace.to_string(), owner.kind.clone(), owner.name.clone()),
            controller,
        );
    }

    /// Successful node writes so far
    pub fn node_writes(&self) -> usize {
        self.node_writes.load(Ordering::SeqCst)
    }

    /// Make every following `update_node` fail with a backend error
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.node(name))
    }

    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodRecord>, StoreError> {
        Ok(self.pods.get(key).map(|p| p.clone()))
    }

    async fn update_node(
        &self,
        node: &NodeRecord,
        expected: &Version,
    ) -> Result<UpdateOutcome, StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected update failure".to_string()));
        }

        let updated = {
            let Some(mut stored) = self.nodes.get_mut(&node.name) else {
                return Err(StoreError::NotFound {
                    kind: "node",
                    name: node.name.clone(),
                });
            };
            if stored.version != *expected {
                debug!(
                    node = %node.name,
                    expected = %expected,
                    stored = %stored.version,
                    "Rejecting stale node write"
                );
                return Ok(UpdateOutcome::Conflict);
            }
            stored.annotations = node.annotations.clone();
            stored.conditions = node.conditions.clone();
            stored.version = self.bump();
            stored.clone()
        };

        self.node_writes.fetch_add(1, Ordering::SeqCst);
        let version = updated.version.clone();
        self.emit(ChangeEvent::Node(updated));
        Ok(UpdateOutcome::Updated(version))
    }

    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodKey>, StoreError> {
        Ok(self
            .by_node
            .get(node_name)
            .map(|bound| bound.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn controller_of(
        &self,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Option<OwnerRef>, StoreError> {
        let key = (namespace.to_string(), owner.kind.clone(), owner.name.clone());
        Ok(self.controllers.get(&key).map(|c| c.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}
