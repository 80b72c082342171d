//! Node cost controller
//!
//! Keeps the cost cache in a node's annotations fresh and publishes the
//! node's cost gauges. The cached value is only ever changed through a
//! read-compute-conditional-write cycle; a rejected write is retried from
//! scratch, never merged.

use super::{ControllerSettings, NodeInfoCache};
use crate::annotations::{
    billed_hours, format_cost, format_timestamp, CostCacheEntry, StoredCost,
    COST_CONDITION_TYPE, REASON_UNKNOWN, REASON_UPDATED,
};
use crate::error::StoreError;
use crate::events::{CostEvent, EventRecorder, ObjectReference};
use crate::models::{CostValue, NodeCondition, NodeInfo, NodeRecord};
use crate::observability::StructuredLogger;
use crate::pricing::{PriceQuote, Providers};
use crate::reconcile::{bounded, Action, Reconciled, Retry, RetryReason};
use crate::sink::{GaugeFamily, MetricsSink};
use crate::store::{ObjectStore, UpdateOutcome};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Final state of one node cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeCycle {
    /// The node is gone or being deleted; its gauges were withdrawn
    Removed,
    Resolved(CostValue),
}

impl NodeCycle {
    pub fn action(&self, settings: &ControllerSettings) -> Action {
        match self {
            NodeCycle::Removed => Action::Done,
            NodeCycle::Resolved(_) => Action::RequeueAfter(settings.refresh_interval),
        }
    }
}

pub struct NodeController {
    store: Arc<dyn ObjectStore>,
    providers: Arc<Providers>,
    events: Arc<dyn EventRecorder>,
    sink: Arc<dyn MetricsSink>,
    info_cache: NodeInfoCache,
    settings: ControllerSettings,
    logger: StructuredLogger,
}

impl NodeController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        providers: Arc<Providers>,
        events: Arc<dyn EventRecorder>,
        sink: Arc<dyn MetricsSink>,
        info_cache: NodeInfoCache,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            providers,
            events,
            sink,
            info_cache,
            settings,
            logger: StructuredLogger::new("node-controller"),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Run one cycle for the node called `name`
    pub async fn reconcile(&self, name: &str) -> Reconciled<NodeCycle> {
        let node = match bounded(self.settings.call_timeout, self.store.get_node(name)).await {
            Ok(Some(node)) => node,
            Ok(None) => return Reconciled::Success(self.remove(name)),
            Err(e) => return Reconciled::from_store(e, self.settings.requeue_delay),
        };

        if node.deleting {
            return Reconciled::Success(self.remove(name));
        }
        if !node.ready {
            debug!(node = %name, "Node is not ready yet");
            return Reconciled::Retry(Retry::after(
                RetryReason::NodeNotReady,
                self.settings.requeue_delay,
            ));
        }

        let now = Utc::now();
        let entry = CostCacheEntry::read(&node, &self.settings.keys);
        let (node, refreshed) = if entry.is_stale(now, self.settings.refresh_interval) {
            match crate::settle!(self.refresh(node, &entry, now).await) {
                Some(node) => (node, true),
                None => return Reconciled::Success(self.remove(name)),
            }
        } else {
            (node, false)
        };

        let Some((node, cost)) = crate::settle!(self.resolve_persisted(node).await) else {
            return Reconciled::Success(self.remove(name));
        };
        let Some(node) = crate::settle!(self.repair_condition(node, cost, now).await) else {
            return Reconciled::Success(self.remove(name));
        };

        match cost {
            CostValue::Known(hourly) => {
                let info = crate::settle!(self.node_info(&node).await);
                if refreshed {
                    self.logger
                        .log_node_cost_refreshed(&node.name, hourly, &info.instance_type);
                }
                self.publish(&node, hourly, &info, now);
            }
            CostValue::Unknown => {
                self.logger.log_node_cost_unknown(&node.name);
                self.withdraw(&node.name);
            }
        }

        Reconciled::Success(NodeCycle::Resolved(cost))
    }

    /// Ask the provider for a new price and persist it
    ///
    /// `None` means the node disappeared before the write.
    async fn refresh(
        &self,
        node: NodeRecord,
        entry: &CostCacheEntry,
        now: DateTime<Utc>,
    ) -> Reconciled<Option<NodeRecord>> {
        let provider = self.providers.select(&node);
        debug!(node = %node.name, provider = ?provider.kind(), "Fetching node hourly cost");

        let quote = match bounded(
            self.settings.call_timeout,
            provider.hourly_cost(&node, self.events.as_ref()),
        )
        .await
        {
            Ok(quote) => quote,
            Err(e) => return Reconciled::from_provider(e, self.settings.requeue_delay),
        };

        let value = match quote {
            PriceQuote::Price(price) => CostValue::from_price(price),
            PriceQuote::Unknown => CostValue::Unknown,
            PriceQuote::RetryLater => {
                debug!(node = %node.name, "Price not available yet");
                return Reconciled::Retry(Retry::after(
                    RetryReason::PriceNotReady,
                    self.settings.requeue_delay,
                ));
            }
        };
        self.info_cache.invalidate(&node.name);

        if !value.is_known() && entry.stored == StoredCost::Unknown {
            // Already recorded as unknown; rewriting would only notify watchers again
            return Reconciled::Success(Some(node));
        }

        let keys = &self.settings.keys;
        let mut updated = node.clone();
        updated
            .annotations
            .insert(keys.hourly_cost.clone(), format_cost(value));
        updated
            .annotations
            .insert(keys.updated_at.clone(), format_timestamp(now));
        let condition = cost_condition(node.condition(COST_CONDITION_TYPE), value, now);
        updated.set_condition(condition);

        self.write(updated, &node).await
    }

    /// Re-read the persisted value; an unusable one is cleared so the next
    /// cycle fetches a fresh price
    async fn resolve_persisted(
        &self,
        node: NodeRecord,
    ) -> Reconciled<Option<(NodeRecord, CostValue)>> {
        let keys = &self.settings.keys;
        let raw = match StoredCost::from_annotations(&node.annotations, keys) {
            StoredCost::Known(v) => return Reconciled::Success(Some((node, CostValue::Known(v)))),
            StoredCost::Absent | StoredCost::Unknown => {
                return Reconciled::Success(Some((node, CostValue::Unknown)))
            }
            StoredCost::Invalid(raw) => raw,
        };

        self.logger.log_cache_cleared(&node.name, &raw);
        self.events
            .publish(
                &ObjectReference::node(&node.name),
                CostEvent::warning(
                    "InvalidCachedCost",
                    format!("cleared unusable cached hourly cost {:?}", raw),
                ),
            )
            .await;

        let mut cleared = node.clone();
        cleared.annotations.remove(&keys.hourly_cost);
        cleared.annotations.remove(&keys.updated_at);
        cleared.remove_condition(COST_CONDITION_TYPE);
        self.info_cache.invalidate(&node.name);

        let written = crate::settle!(self.write(cleared, &node).await);
        Reconciled::Success(written.map(|n| (n, CostValue::Unknown)))
    }

    /// Rewrite the cost condition when it disagrees with the persisted value
    ///
    /// The store may land annotations and condition in separate requests, so
    /// a cycle that failed in between leaves a fresh cache with an outdated
    /// condition. A cleared cache carries no condition and is left alone.
    async fn repair_condition(
        &self,
        node: NodeRecord,
        cost: CostValue,
        now: DateTime<Utc>,
    ) -> Reconciled<Option<NodeRecord>> {
        if !node.annotations.contains_key(&self.settings.keys.hourly_cost) {
            return Reconciled::Success(Some(node));
        }
        let existing = node.condition(COST_CONDITION_TYPE);
        let expected = cost_condition(existing, cost, now);
        let consistent = existing.is_some_and(|c| {
            c.status == expected.status
                && c.reason == expected.reason
                && c.message == expected.message
        });
        if consistent {
            return Reconciled::Success(Some(node));
        }

        debug!(
            node = %node.name,
            known = cost.is_known(),
            "Cost condition out of date, rewriting"
        );
        let mut updated = node.clone();
        updated.set_condition(expected);
        self.write(updated, &node).await
    }

    /// Conditional write carrying the version `read` was loaded at
    async fn write(&self, mut updated: NodeRecord, read: &NodeRecord) -> Reconciled<Option<NodeRecord>> {
        match bounded(
            self.settings.call_timeout,
            self.store.update_node(&updated, &read.version),
        )
        .await
        {
            Ok(UpdateOutcome::Updated(version)) => {
                updated.version = version;
                Reconciled::Success(Some(updated))
            }
            Ok(UpdateOutcome::Conflict) => {
                debug!(node = %read.name, "Node changed since read, retrying");
                Reconciled::Retry(Retry::now(RetryReason::VersionConflict))
            }
            Err(StoreError::NotFound { .. }) => Reconciled::Success(None),
            Err(e) => {
                self.events
                    .publish(
                        &ObjectReference::node(&read.name),
                        CostEvent::warning("UpdateNodeFailed", e.to_string()),
                    )
                    .await;
                Reconciled::from_store(e, self.settings.requeue_delay)
            }
        }
    }

    async fn node_info(&self, node: &NodeRecord) -> Reconciled<NodeInfo> {
        if let Some(info) = self.info_cache.get(&node.name) {
            return Reconciled::Success(info);
        }
        let provider = self.providers.select(node);
        match bounded(
            self.settings.call_timeout,
            provider.node_info(node, self.events.as_ref()),
        )
        .await
        {
            Ok(info) => {
                self.info_cache.insert(&node.name, info.clone());
                Reconciled::Success(info)
            }
            Err(e) => Reconciled::from_provider(e, self.settings.requeue_delay),
        }
    }

    fn publish(&self, node: &NodeRecord, hourly: f64, info: &NodeInfo, now: DateTime<Utc>) {
        let labels = [
            node.name.as_str(),
            info.instance_type.as_str(),
            info.capacity.as_str(),
            info.id.as_str(),
            info.availability_zone.as_str(),
        ];
        self.withdraw(&node.name);
        self.sink
            .set_gauge(GaugeFamily::NodeHourlyCost, &labels, hourly);
        self.sink.set_gauge(
            GaugeFamily::NodeTotalCost,
            &labels,
            hourly * billed_hours(node.created_at, now),
        );
    }

    fn withdraw(&self, name: &str) {
        for family in GaugeFamily::NODE {
            self.sink.delete_matching(family, &[("name", name)]);
        }
    }

    fn remove(&self, name: &str) -> NodeCycle {
        debug!(node = %name, "Node removed, withdrawing cost");
        self.withdraw(name);
        self.info_cache.invalidate(name);
        NodeCycle::Removed
    }
}

/// Cost condition for `value`, keeping the transition time while the status holds
fn cost_condition(
    existing: Option<&NodeCondition>,
    value: CostValue,
    now: DateTime<Utc>,
) -> NodeCondition {
    let status = value.is_known();
    let (reason, message) = match value {
        CostValue::Known(_) => (
            REASON_UPDATED,
            format!("costwatch hourly cost is {}", format_cost(value)),
        ),
        CostValue::Unknown => (REASON_UNKNOWN, "costwatch hourly cost is unknown".to_string()),
    };
    let last_transition = match existing {
        Some(c) if c.status == status => c.last_transition.or(Some(now)),
        _ => Some(now),
    };

    NodeCondition {
        condition_type: COST_CONDITION_TYPE.to_string(),
        status,
        reason: reason.to_string(),
        message,
        last_heartbeat: Some(now),
        last_transition,
    }
}
