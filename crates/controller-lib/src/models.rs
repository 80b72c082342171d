//! Core data models for the cost controllers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque version token used for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Estimated hourly cost of a node
///
/// Known values are strictly positive; zero and negative inputs collapse
/// into `Unknown` through [`CostValue::from_price`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CostValue {
    Known(f64),
    Unknown,
}

impl CostValue {
    pub fn from_price(price: f64) -> Self {
        if price.is_finite() && price > 0.0 {
            CostValue::Known(price)
        } else {
            CostValue::Unknown
        }
    }

    pub fn known(&self) -> Option<f64> {
        match self {
            CostValue::Known(v) => Some(*v),
            CostValue::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, CostValue::Known(_))
    }
}

/// Resources a node offers for scheduling
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Allocatable {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// Status condition attached to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Node record as seen by the controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    /// Cloud provider id (e.g. `aws:///eu-central-1a/i-0abc`), empty when absent
    pub provider_id: String,
    pub allocatable: Allocatable,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<NodeCondition>,
    pub created_at: DateTime<Utc>,
    /// Deletion is pending
    pub deleting: bool,
    pub version: Version,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_id: String::new(),
            allocatable: Allocatable::default(),
            ready: true,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            conditions: Vec::new(),
            created_at: Utc::now(),
            deleting: false,
            version: Version::default(),
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or replace a condition by type
    pub fn set_condition(&mut self, condition: NodeCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }

    pub fn remove_condition(&mut self, condition_type: &str) -> Option<NodeCondition> {
        let idx = self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition_type)?;
        Some(self.conditions.remove(idx))
    }
}

/// Namespaced pod identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from an object to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

impl OwnerRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            controller: true,
        }
    }
}

/// Resources allocated to a single container
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerAllocation {
    pub name: String,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
}

/// Pod record as seen by the controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub key: PodKey,
    /// Bound node, `None` until scheduled
    pub node_name: Option<String>,
    pub containers: Vec<ContainerAllocation>,
    pub owners: Vec<OwnerRef>,
    pub created_at: DateTime<Utc>,
    pub deleting: bool,
    pub version: Version,
}

impl PodRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: PodKey::new(namespace, name),
            node_name: None,
            containers: Vec::new(),
            owners: Vec::new(),
            created_at: Utc::now(),
            deleting: false,
            version: Version::default(),
        }
    }

    /// Pod totals summed over all containers
    pub fn allocated(&self) -> Allocatable {
        self.containers
            .iter()
            .fold(Allocatable::default(), |acc, c| Allocatable {
                cpu_cores: acc.cpu_cores + c.cpu_cores,
                // Quantities saturate at u64::MAX when parsed
                memory_bytes: acc.memory_bytes.saturating_add(c.memory_bytes),
            })
    }

    /// The controlling owner, falling back to the first listed one
    pub fn direct_owner(&self) -> Option<&OwnerRef> {
        self.owners
            .iter()
            .find(|o| o.controller)
            .or_else(|| self.owners.first())
    }
}

/// Static node information resolved by a pricing provider
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub instance_type: String,
    pub capacity: String,
    pub availability_zone: String,
}

/// Purchase option of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeCapacity {
    Spot,
    OnDemand,
}

impl NodeCapacity {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCapacity::Spot => "spot",
            NodeCapacity::OnDemand => "on-demand",
        }
    }
}

impl fmt::Display for NodeCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of anything the runner reconciles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Node(String),
    Pod(PodKey),
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Node(name) => write!(f, "node/{}", name),
            ObjectKey::Pod(key) => write!(f, "pod/{}", key),
        }
    }
}
