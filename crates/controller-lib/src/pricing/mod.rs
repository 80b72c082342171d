//! Pricing providers
//!
//! A node is priced either by the cloud it runs on or by values an operator
//! put on the node itself. The variant is picked once per node from its
//! provider id; controllers only ever talk to [`Provider`].

mod cloud;
mod manual;

pub use cloud::{
    instance_id, CatalogEntry, CloudCatalog, CloudProvider, InstanceDescription, PriceLookup,
    StaticCatalog,
};
pub use manual::ManualProvider;

use crate::annotations::AnnotationKeys;
use crate::error::ProviderError;
use crate::events::EventRecorder;
use crate::models::{NodeInfo, NodeRecord};
use std::sync::Arc;

/// Answer of a price lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceQuote {
    Price(f64),
    /// No price can be determined for now
    Unknown,
    /// A price will exist but has not materialized yet
    RetryLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Cloud,
    Manual,
}

impl ProviderKind {
    pub fn for_provider_id(provider_id: &str) -> Self {
        if provider_id.starts_with("aws://") {
            ProviderKind::Cloud
        } else {
            ProviderKind::Manual
        }
    }
}

/// Provider chosen for one node
pub enum Provider<'a> {
    Cloud(&'a CloudProvider),
    Manual(&'a ManualProvider),
}

impl Provider<'_> {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Cloud(_) => ProviderKind::Cloud,
            Provider::Manual(_) => ProviderKind::Manual,
        }
    }

    pub async fn hourly_cost(
        &self,
        node: &NodeRecord,
        events: &dyn EventRecorder,
    ) -> Result<PriceQuote, ProviderError> {
        match self {
            Provider::Cloud(p) => p.hourly_cost(node, events).await,
            Provider::Manual(p) => Ok(p.hourly_cost(node, events).await),
        }
    }

    pub async fn node_info(
        &self,
        node: &NodeRecord,
        events: &dyn EventRecorder,
    ) -> Result<NodeInfo, ProviderError> {
        match self {
            Provider::Cloud(p) => p.node_info(node, events).await,
            Provider::Manual(p) => Ok(p.node_info(node, events).await),
        }
    }
}

/// Every configured provider
pub struct Providers {
    cloud: CloudProvider,
    manual: ManualProvider,
}

impl Providers {
    pub fn new(keys: AnnotationKeys, catalog: Arc<dyn CloudCatalog>) -> Self {
        Self {
            cloud: CloudProvider::new(catalog),
            manual: ManualProvider::new(keys),
        }
    }

    pub fn select(&self, node: &NodeRecord) -> Provider<'_> {
        match ProviderKind::for_provider_id(&node.provider_id) {
            ProviderKind::Cloud => Provider::Cloud(&self.cloud),
            ProviderKind::Manual => Provider::Manual(&self.manual),
        }
    }
}
