//! Cloud pricing for nodes carrying an `aws://` provider id

use super::PriceQuote;
use crate::error::ProviderError;
use crate::events::{CostEvent, EventRecorder, ObjectReference};
use crate::models::{NodeCapacity, NodeInfo, NodeRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
const LABEL_INSTANCE_TYPE_BETA: &str = "beta.kubernetes.io/instance-type";
const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
const LABEL_KARPENTER_CAPACITY: &str = "karpenter.sh/capacity-type";
const LABEL_EKS_CAPACITY: &str = "eks.amazonaws.com/capacityType";

/// Extract the instance id from `aws:///<zone>/i-<id>`
pub fn instance_id(provider_id: &str) -> Option<String> {
    let rest = provider_id.strip_prefix("aws:///")?;
    let (zone, id) = rest.split_once('/')?;
    let zone_ok = !zone.is_empty()
        && zone
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let suffix = id.strip_prefix("i-")?;
    let id_ok = !suffix.is_empty() && suffix.chars().all(|c| c.is_alphanumeric() || c == '_');
    (zone_ok && id_ok).then(|| id.to_string())
}

/// What the cloud knows about one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub capacity: NodeCapacity,
}

impl InstanceDescription {
    /// Region of the availability zone (`eu-central-1a` -> `eu-central-1`)
    pub fn region(&self) -> &str {
        let zone = self.availability_zone.as_str();
        match zone.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => &zone[..zone.len() - 1],
            _ => zone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceLookup {
    Price(f64),
    /// The price record exists upstream but is not visible yet
    Pending,
    Missing,
}

/// Cloud inventory and price list
#[async_trait]
pub trait CloudCatalog: Send + Sync {
    /// `Ok(None)` when the instance is unknown to the cloud
    async fn describe(
        &self,
        node: &NodeRecord,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, ProviderError>;

    async fn hourly_price(&self, instance: &InstanceDescription)
        -> Result<PriceLookup, ProviderError>;
}

/// One row of a configured price table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub instance_type: String,
    #[serde(default = "default_capacity")]
    pub capacity: NodeCapacity,
    /// Applies to every region when absent
    #[serde(default)]
    pub region: Option<String>,
    pub hourly: f64,
}

fn default_capacity() -> NodeCapacity {
    NodeCapacity::OnDemand
}

/// Catalog answering from a configured price table
///
/// Instances are described from the well-known node labels, falling back
/// to the zone embedded in the provider id.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn capacity_of(node: &NodeRecord) -> NodeCapacity {
        let raw = node
            .labels
            .get(LABEL_KARPENTER_CAPACITY)
            .or_else(|| node.labels.get(LABEL_EKS_CAPACITY));
        match raw.map(|v| v.to_ascii_lowercase()) {
            Some(v) if v == "spot" => NodeCapacity::Spot,
            _ => NodeCapacity::OnDemand,
        }
    }
}

#[async_trait]
impl CloudCatalog for StaticCatalog {
    async fn describe(
        &self,
        node: &NodeRecord,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, ProviderError> {
        let Some(instance_type) = node
            .labels
            .get(LABEL_INSTANCE_TYPE)
            .or_else(|| node.labels.get(LABEL_INSTANCE_TYPE_BETA))
        else {
            return Ok(None);
        };
        let availability_zone = node
            .labels
            .get(LABEL_ZONE)
            .cloned()
            .or_else(|| {
                node.provider_id
                    .strip_prefix("aws:///")
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Ok(Some(InstanceDescription {
            instance_id: instance_id.to_string(),
            instance_type: instance_type.clone(),
            availability_zone,
            capacity: Self::capacity_of(node),
        }))
    }

    async fn hourly_price(
        &self,
        instance: &InstanceDescription,
    ) -> Result<PriceLookup, ProviderError> {
        let region = instance.region();
        let candidates = self.entries.iter().filter(|e| {
            e.instance_type == instance.instance_type && e.capacity == instance.capacity
        });

        // A region specific row wins over a global one
        let mut global = None;
        for entry in candidates {
            match entry.region.as_deref() {
                Some(r) if r == region => return Ok(PriceLookup::Price(entry.hourly)),
                None if global.is_none() => global = Some(entry.hourly),
                _ => {}
            }
        }
        Ok(global.map(PriceLookup::Price).unwrap_or(PriceLookup::Missing))
    }
}

pub struct CloudProvider {
    catalog: Arc<dyn CloudCatalog>,
}

impl CloudProvider {
    pub fn new(catalog: Arc<dyn CloudCatalog>) -> Self {
        Self { catalog }
    }

    async fn instance(
        &self,
        node: &NodeRecord,
        events: &dyn EventRecorder,
    ) -> Result<Option<InstanceDescription>, ProviderError> {
        let target = ObjectReference::node(&node.name);
        let Some(id) = instance_id(&node.provider_id) else {
            events
                .publish(
                    &target,
                    CostEvent::warning(
                        "UnknownProviderID",
                        format!(".spec.providerID {:?} is not aws:///<zone>/i-<id>", node.provider_id),
                    ),
                )
                .await;
            return Ok(None);
        };

        match self.catalog.describe(node, &id).await {
            Ok(Some(instance)) => Ok(Some(instance)),
            Ok(None) => {
                events
                    .publish(
                        &target,
                        CostEvent::warning("InstanceNotFound", format!("instance {} not found", id)),
                    )
                    .await;
                Ok(None)
            }
            Err(e) => {
                events
                    .publish(
                        &target,
                        CostEvent::warning("DescribeInstanceFailed", e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    pub async fn hourly_cost(
        &self,
        node: &NodeRecord,
        events: &dyn EventRecorder,
    ) -> Result<PriceQuote, ProviderError> {
        let Some(instance) = self.instance(node, events).await? else {
            return Ok(PriceQuote::Unknown);
        };
        let target = ObjectReference::node(&node.name);

        match self.catalog.hourly_price(&instance).await? {
            PriceLookup::Price(price) => {
                debug!(
                    node = %node.name,
                    instance_type = %instance.instance_type,
                    capacity = %instance.capacity,
                    price = price,
                    "Resolved instance price"
                );
                events
                    .publish(&target, CostEvent::normal("HourlyCost", price.to_string()))
                    .await;
                Ok(PriceQuote::Price(price))
            }
            PriceLookup::Pending => Ok(PriceQuote::RetryLater),
            PriceLookup::Missing => {
                events
                    .publish(
                        &target,
                        CostEvent::warning(
                            "NoPricingData",
                            format!(
                                "no {} price for {} in {}",
                                instance.capacity,
                                instance.instance_type,
                                instance.region()
                            ),
                        ),
                    )
                    .await;
                Ok(PriceQuote::Unknown)
            }
        }
    }

    pub async fn node_info(
        &self,
        node: &NodeRecord,
        events: &dyn EventRecorder,
    ) -> Result<NodeInfo, ProviderError> {
        Ok(self
            .instance(node, events)
            .await?
            .map(|i| NodeInfo {
                capacity: i.capacity.to_string(),
                id: i.instance_id,
                instance_type: i.instance_type,
                availability_zone: i.availability_zone,
            })
            .unwrap_or_default())
    }
}
