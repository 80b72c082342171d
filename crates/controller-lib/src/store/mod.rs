//! Versioned object store interface
//!
//! Controllers only see this trait. [`InMemoryStore`] backs the tests and
//! [`KubeStore`] talks to the cluster API.

mod kubernetes;
mod memory;
pub mod quantity;

pub use kubernetes::{KubeEventRecorder, KubeStore};
pub use memory::InMemoryStore;

use crate::error::StoreError;
use crate::models::{NodeRecord, OwnerRef, PodKey, PodRecord, Version};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Capacity of the change notification channel
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Result of a version-checked write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Written; carries the version the store assigned
    Updated(Version),
    /// The stored version no longer matches the expected one
    Conflict,
}

/// Change notification emitted by the store
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Node(NodeRecord),
    NodeDeleted(String),
    Pod(PodKey),
    PodDeleted(PodKey),
    /// The watch was re-established; consumers should resync everything
    Resync,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the node does not exist
    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>, StoreError>;

    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodRecord>, StoreError>;

    /// Persist annotations and conditions of `node` if the stored version
    /// still equals `expected`
    async fn update_node(
        &self,
        node: &NodeRecord,
        expected: &Version,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Pods whose node binding equals `node_name`
    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodKey>, StoreError>;

    /// Controlling owner of the object `owner` refers to, if it has one
    async fn controller_of(
        &self,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Option<OwnerRef>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
