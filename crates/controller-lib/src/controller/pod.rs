//! Pod cost controller
//!
//! Derives a pod's share of its node's cost from the node's cached price.
//! This controller never calls a pricing provider; it re-runs whenever its
//! node's cached price changes.

use super::owner::{resolve_owner, DisplayOwner};
use super::ControllerSettings;
use crate::allocation::{pod_hourly_cost, unit_prices, UnitPrices};
use crate::annotations::{billed_hours, StoredCost};
use crate::error::CycleError;
use crate::events::{CostEvent, EventRecorder, ObjectReference};
use crate::models::{PodKey, PodRecord};
use crate::observability::StructuredLogger;
use crate::reconcile::{bounded, Action, Reconciled, Retry, RetryReason};
use crate::sink::{GaugeFamily, MetricsSink};
use crate::store::ObjectStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Figures published for one pod
#[derive(Debug, Clone, PartialEq)]
pub struct PodCost {
    pub node: String,
    pub unit_prices: UnitPrices,
    pub hourly: f64,
    pub total: f64,
    pub owner: DisplayOwner,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodCycle {
    /// Pod or its node is gone; gauges withdrawn
    Removed,
    /// Node cost is unknown; gauges withdrawn
    CostUnknown,
    Published(PodCost),
}

impl PodCycle {
    pub fn action(&self) -> Action {
        // Node refreshes re-trigger pods, so nothing needs a timer here
        Action::Done
    }
}

pub struct PodController {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventRecorder>,
    sink: Arc<dyn MetricsSink>,
    settings: ControllerSettings,
    logger: StructuredLogger,
}

impl PodController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventRecorder>,
        sink: Arc<dyn MetricsSink>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            events,
            sink,
            settings,
            logger: StructuredLogger::new("pod-controller"),
        }
    }

    pub async fn reconcile(&self, key: &PodKey) -> Reconciled<PodCycle> {
        let delay = self.settings.requeue_delay;
        let pod = match bounded(self.settings.call_timeout, self.store.get_pod(key)).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                self.withdraw(key);
                return Reconciled::Success(PodCycle::Removed);
            }
            Err(e) => return Reconciled::from_store(e, delay),
        };

        let Some(node_name) = pod.node_name.clone() else {
            debug!(pod = %key, "Pod is not scheduled yet");
            return Reconciled::Retry(Retry::after(RetryReason::PodNotScheduled, delay));
        };
        if pod.deleting {
            self.withdraw(key);
            return Reconciled::Success(PodCycle::Removed);
        }

        // The only node read of this cycle; every figure below derives from it
        let node = match bounded(self.settings.call_timeout, self.store.get_node(&node_name)).await
        {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(pod = %key, node = %node_name, "Bound node is gone");
                self.withdraw(key);
                return Reconciled::Success(PodCycle::Removed);
            }
            Err(e) => return Reconciled::from_store(e, delay),
        };

        let node_hourly = match StoredCost::from_annotations(&node.annotations, &self.settings.keys)
        {
            StoredCost::Known(v) => v,
            StoredCost::Absent => {
                debug!(pod = %key, node = %node_name, "Node has no cached cost yet");
                return Reconciled::Retry(Retry::after(RetryReason::NodeNotProcessed, delay));
            }
            StoredCost::Unknown | StoredCost::Invalid(_) => {
                self.withdraw(key);
                return Reconciled::Success(PodCycle::CostUnknown);
            }
        };

        let prices = match unit_prices(node_hourly, &node.allocatable) {
            Ok(prices) => prices,
            Err(e) => {
                self.withdraw(key);
                self.events
                    .publish(
                        &ObjectReference::pod(&key.namespace, &key.name),
                        CostEvent::warning(
                            "CostAllocationFailed",
                            format!("node {}: {}", node_name, e),
                        ),
                    )
                    .await;
                return Reconciled::Fail(CycleError::Allocation(e));
            }
        };
        let hourly = pod_hourly_cost(&prices, &pod.allocated());

        let owner = crate::settle!(
            resolve_owner(self.store.as_ref(), &pod, self.settings.call_timeout, delay).await
        );

        let cost = PodCost {
            total: hourly * billed_hours(pod.created_at, Utc::now()),
            node: node_name,
            unit_prices: prices,
            hourly,
            owner,
        };
        self.publish(&pod, &cost);
        Reconciled::Success(PodCycle::Published(cost))
    }

    fn publish(&self, pod: &PodRecord, cost: &PodCost) {
        let labels = [
            pod.key.name.as_str(),
            pod.key.namespace.as_str(),
            cost.owner.kind.as_str(),
            cost.owner.name.as_str(),
            cost.node.as_str(),
        ];

        // Old series may carry a previous node or owner
        self.withdraw(&pod.key);
        self.sink.set_gauge(
            GaugeFamily::PodCpuHourlyCost,
            &labels,
            cost.unit_prices.cpu_core_hourly,
        );
        self.sink.set_gauge(
            GaugeFamily::PodMemoryHourlyCost,
            &labels,
            cost.unit_prices.memory_mib_hourly,
        );
        self.sink
            .set_gauge(GaugeFamily::PodRequestsHourlyCost, &labels, cost.hourly);
        self.sink
            .set_gauge(GaugeFamily::PodRequestsTotalCost, &labels, cost.total);

        self.logger.log_pod_cost(
            &pod.key.to_string(),
            &cost.node,
            &cost.owner.kind,
            &cost.owner.name,
            cost.hourly,
        );
    }

    fn withdraw(&self, key: &PodKey) {
        let partial = [
            ("name", key.name.as_str()),
            ("namespace", key.namespace.as_str()),
        ];
        for family in GaugeFamily::POD {
            self.sink.delete_matching(family, &partial);
        }
    }
}
