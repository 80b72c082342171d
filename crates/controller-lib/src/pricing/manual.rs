//! Operator supplied pricing read from the node's own annotations
//!
//! Static info annotations hold either a literal or an indirection:
//! `label=<key>` or `annotation=<key>` resolved against the same node.

use super::PriceQuote;
use crate::annotations::{AnnotationKeys, StoredCost};
use crate::events::{CostEvent, EventRecorder, ObjectReference};
use crate::models::{NodeInfo, NodeRecord};

pub const MANUAL_NODE_ID: &str = "manual";

#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    Value(String),
    /// The annotation itself is not set
    NotSet,
    /// An indirection pointed at a key that does not exist
    Unresolved(String),
}

pub struct ManualProvider {
    keys: AnnotationKeys,
}

impl ManualProvider {
    pub fn new(keys: AnnotationKeys) -> Self {
        Self { keys }
    }

    pub async fn hourly_cost(&self, node: &NodeRecord, events: &dyn EventRecorder) -> PriceQuote {
        let target = ObjectReference::node(&node.name);
        let warning = match StoredCost::from_annotations(&node.annotations, &self.keys) {
            StoredCost::Known(price) => return PriceQuote::Price(price),
            StoredCost::Absent => CostEvent::warning(
                "NoHourlyCost",
                format!(
                    "no pricing provider for this .spec.providerID and {} is not set",
                    self.keys.hourly_cost
                ),
            ),
            StoredCost::Unknown => CostEvent::warning(
                "NodeHourlyCostUnknown",
                format!("node {} has unknown hourly cost", node.name),
            ),
            StoredCost::Invalid(raw) => CostEvent::warning(
                "InvalidHourlyCost",
                format!("failed to parse the node price: {}", raw),
            ),
        };
        events.publish(&target, warning).await;
        PriceQuote::Unknown
    }

    pub async fn node_info(&self, node: &NodeRecord, events: &dyn EventRecorder) -> NodeInfo {
        NodeInfo {
            id: MANUAL_NODE_ID.to_string(),
            capacity: self
                .field(node, &self.keys.capacity, "Capacity", events)
                .await,
            instance_type: self
                .field(node, &self.keys.instance_type, "Type", events)
                .await,
            availability_zone: self
                .field(node, &self.keys.availability_zone, "AvailabilityZone", events)
                .await,
        }
    }

    /// Resolve one info annotation, warning and leaving it empty on failure
    async fn field(
        &self,
        node: &NodeRecord,
        key: &str,
        name: &str,
        events: &dyn EventRecorder,
    ) -> String {
        let warning = match resolve(node, key) {
            Lookup::Value(v) if !v.is_empty() => return v,
            Lookup::Value(_) => {
                CostEvent::warning(format!("Empty{}", name), format!("{} is an empty string", key))
            }
            Lookup::NotSet => {
                CostEvent::warning(format!("No{}", name), format!("{} is not defined", key))
            }
            Lookup::Unresolved(reason) => CostEvent::warning(format!("{}GetError", name), reason),
        };
        events.publish(&ObjectReference::node(&node.name), warning).await;
        String::new()
    }
}

fn resolve(node: &NodeRecord, key: &str) -> Lookup {
    let Some(raw) = node.annotations.get(key) else {
        return Lookup::NotSet;
    };

    let (map, selector, kind) = if let Some(label) = raw.strip_prefix("label=") {
        (&node.labels, label, "label")
    } else if let Some(annotation) = raw.strip_prefix("annotation=") {
        (&node.annotations, annotation, "annotation")
    } else {
        return Lookup::Value(raw.clone());
    };

    match map.get(selector) {
        Some(v) => Lookup::Value(v.clone()),
        None => Lookup::Unresolved(format!("could not find {} {}", kind, selector)),
    }
}
