use super::*;
use crate::annotations::{format_timestamp, AnnotationKeys, COST_CONDITION_TYPE};
use crate::error::{AllocationError, CycleError, ProviderError};
use crate::events::MemoryRecorder;
use crate::models::{
    Allocatable, ContainerAllocation, CostValue, NodeCapacity, NodeRecord, OwnerRef, PodKey,
    PodRecord,
};
use crate::pricing::{CloudCatalog, InstanceDescription, PriceLookup, Providers};
use crate::reconcile::{Reconciled, RetryReason};
use crate::sink::{GaugeFamily, PrometheusSink};
use crate::store::{InMemoryStore, ObjectStore};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use prometheus::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

type Hook = Box<dyn FnOnce() + Send>;

/// Catalog with a settable answer that counts every call
#[derive(Default)]
struct ScriptedCatalog {
    answer: Mutex<Option<PriceLookup>>,
    describes: AtomicUsize,
    lookups: AtomicUsize,
    /// Runs once, right before the next price answer is returned
    before_answer: Mutex<Option<Hook>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedCatalog {
    fn answering(lookup: PriceLookup) -> Self {
        let catalog = Self::default();
        catalog.set(lookup);
        catalog
    }

    fn set(&self, lookup: PriceLookup) {
        *self.answer.lock().unwrap() = Some(lookup);
    }

    fn calls(&self) -> usize {
        self.describes.load(Ordering::SeqCst) + self.lookups.load(Ordering::SeqCst)
    }

    fn before_next_answer(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_answer.lock().unwrap() = Some(Box::new(hook));
    }

    fn stall(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl CloudCatalog for ScriptedCatalog {
    async fn describe(
        &self,
        _node: &NodeRecord,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, ProviderError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(InstanceDescription {
            instance_id: instance_id.to_string(),
            instance_type: "m5.large".to_string(),
            availability_zone: "eu-central-1a".to_string(),
            capacity: NodeCapacity::OnDemand,
        }))
    }

    async fn hourly_price(
        &self,
        _instance: &InstanceDescription,
    ) -> Result<PriceLookup, ProviderError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hook = self.before_answer.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(self.answer.lock().unwrap().unwrap_or(PriceLookup::Missing))
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    catalog: Arc<ScriptedCatalog>,
    events: Arc<MemoryRecorder>,
    sink: Arc<PrometheusSink>,
    info_cache: NodeInfoCache,
    nodes: NodeController,
    pods: PodController,
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        call_timeout: Duration::from_millis(200),
        ..ControllerSettings::default()
    }
}

fn harness(lookup: PriceLookup) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let catalog = Arc::new(ScriptedCatalog::answering(lookup));
    let events = Arc::new(MemoryRecorder::new());
    let sink = Arc::new(PrometheusSink::new(&Registry::new()).unwrap());
    let info_cache = NodeInfoCache::new();
    let settings = settings();

    let providers = Arc::new(Providers::new(settings.keys.clone(), catalog.clone()));
    let nodes = NodeController::new(
        store.clone(),
        providers,
        events.clone(),
        sink.clone(),
        info_cache.clone(),
        settings.clone(),
    );
    let pods = PodController::new(store.clone(), events.clone(), sink.clone(), settings);

    Harness {
        store,
        catalog,
        events,
        sink,
        info_cache,
        nodes,
        pods,
    }
}

fn aws_node(name: &str) -> NodeRecord {
    let mut node = NodeRecord::new(name);
    node.provider_id = format!("aws:///eu-central-1a/i-{}", name.replace('-', ""));
    node.allocatable = Allocatable {
        cpu_cores: 2.0,
        memory_bytes: 8 * GIB,
    };
    node.created_at = Utc::now() - ChronoDuration::minutes(90);
    node
}

fn manual_node(name: &str, cost: Option<&str>) -> NodeRecord {
    let keys = AnnotationKeys::default();
    let mut node = NodeRecord::new(name);
    node.allocatable = Allocatable {
        cpu_cores: 2.0,
        memory_bytes: 8 * GIB,
    };
    if let Some(cost) = cost {
        node.annotations.insert(keys.hourly_cost, cost.to_string());
    }
    node
}

fn pod_on(name: &str, node: &str, cores: f64, memory: u64) -> PodRecord {
    let mut pod = PodRecord::new("default", name);
    pod.node_name = Some(node.to_string());
    pod.containers.push(ContainerAllocation {
        name: "app".to_string(),
        cpu_cores: cores,
        memory_bytes: memory,
    });
    pod
}

fn cached_cost(h: &Harness, node: &str) -> Option<String> {
    let keys = AnnotationKeys::default();
    h.store.node(node)?.annotations.get(&keys.hourly_cost).cloned()
}

fn resolved(outcome: Reconciled<NodeCycle>) -> CostValue {
    match outcome {
        Reconciled::Success(NodeCycle::Resolved(cost)) => cost,
        other => panic!("expected a resolved cost, got {:?}", other),
    }
}

fn published(outcome: Reconciled<PodCycle>) -> PodCost {
    match outcome {
        Reconciled::Success(PodCycle::Published(cost)) => cost,
        other => panic!("expected published pod cost, got {:?}", other),
    }
}

#[tokio::test]
async fn test_first_cycle_converges_to_provider_price() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.5));
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.5000000000"));

    let node = h.store.node("n1").unwrap();
    let condition = node.condition(COST_CONDITION_TYPE).unwrap();
    assert!(condition.status);
    assert_eq!(condition.reason, "Updated");
    assert!(node
        .annotations
        .contains_key(&AnnotationKeys::default().updated_at));

    // Second cycle inside the refresh window leaves the value alone
    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.5));
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.5000000000"));
}

#[tokio::test]
async fn test_fresh_known_node_is_idempotent() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    let writes = h.store.node_writes();
    let calls = h.catalog.calls();
    let version = h.store.node("n1").unwrap().version;

    for _ in 0..3 {
        resolved(h.nodes.reconcile("n1").await);
    }

    assert_eq!(h.store.node_writes(), writes);
    assert_eq!(h.catalog.calls(), calls);
    assert_eq!(h.store.node("n1").unwrap().version, version);
}

#[tokio::test]
async fn test_node_gauges_published_with_info_labels() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    let hourly = h.sink.series(GaugeFamily::NodeHourlyCost);
    assert_eq!(hourly.len(), 1);
    let (labels, value) = &hourly[0];
    assert_eq!(labels, &["n1", "m5.large", "on-demand", "i-n1", "eu-central-1a"]);
    assert_eq!(*value, 0.5);

    // Created 90 minutes ago: two billed hours
    let total = h.sink.series(GaugeFamily::NodeTotalCost);
    assert!((total[0].1 - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_version_conflict_retries_without_torn_state() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));

    // Another writer touches the node while the price lookup is in flight
    let store = h.store.clone();
    h.catalog.before_next_answer(move || {
        store.modify_node("n1", |n| {
            n.labels.insert("team".to_string(), "payments".to_string());
        });
    });

    let outcome = h.nodes.reconcile("n1").await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::VersionConflict));
    assert!(cached_cost(&h, "n1").is_none());
    assert_eq!(h.store.node_writes(), 0);
    assert!(h.sink.series(GaugeFamily::NodeHourlyCost).is_empty());

    // The retry reflects only the latest provider answer
    h.catalog.set(PriceLookup::Price(0.7));
    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.7));
    let node = h.store.node("n1").unwrap();
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.7000000000"));
    assert_eq!(node.labels["team"], "payments");
    assert_eq!(h.store.node_writes(), 1);
}

#[tokio::test]
async fn test_price_not_ready_retries_without_write() {
    let h = harness(PriceLookup::Pending);
    h.store.put_node(aws_node("n1"));

    let outcome = h.nodes.reconcile("n1").await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::PriceNotReady));
    assert_eq!(h.store.node_writes(), 0);
    assert!(cached_cost(&h, "n1").is_none());
}

#[tokio::test]
async fn test_not_ready_node_is_not_priced() {
    let h = harness(PriceLookup::Price(0.5));
    let mut node = aws_node("n1");
    node.ready = false;
    h.store.put_node(node);

    let outcome = h.nodes.reconcile("n1").await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::NodeNotReady));
    assert_eq!(h.catalog.calls(), 0);
}

#[tokio::test]
async fn test_slow_provider_times_out_as_transient() {
    let h = harness(PriceLookup::Price(0.5));
    h.catalog.stall(Duration::from_secs(5));
    h.store.put_node(aws_node("n1"));

    let outcome = h.nodes.reconcile("n1").await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::Timeout));
    assert_eq!(h.store.node_writes(), 0);
}

#[tokio::test]
async fn test_missing_price_records_unknown_once() {
    let h = harness(PriceLookup::Missing);
    h.store.put_node(aws_node("n1"));

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("unknown"));
    let condition = h.store.node("n1").unwrap().condition(COST_CONDITION_TYPE).cloned().unwrap();
    assert!(!condition.status);
    assert_eq!(condition.reason, "Unknown");
    assert!(h.events.reasons().contains(&"NoPricingData".to_string()));
    assert!(h.sink.series(GaugeFamily::NodeHourlyCost).is_empty());

    // Still unknown: asked again, but nothing is rewritten
    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    assert_eq!(h.store.node_writes(), 1);
}

#[tokio::test]
async fn test_zero_price_is_unknown() {
    let h = harness(PriceLookup::Price(0.0));
    h.store.put_node(aws_node("n1"));

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("unknown"));
}

#[tokio::test]
async fn test_stale_cache_is_refreshed() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    let keys = AnnotationKeys::default();
    h.store.modify_node("n1", |n| {
        n.annotations.insert(
            keys.updated_at.clone(),
            format_timestamp(Utc::now() - ChronoDuration::hours(2)),
        );
    });
    h.catalog.set(PriceLookup::Price(0.6));

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.6));
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.6000000000"));
    let hourly = h.sink.series(GaugeFamily::NodeHourlyCost);
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].1, 0.6);
}

#[tokio::test]
async fn test_corrupt_fresh_cache_is_cleared() {
    let h = harness(PriceLookup::Price(0.5));
    let keys = AnnotationKeys::default();
    let mut node = manual_node("n1", Some("zero-ish"));
    node.annotations
        .insert(keys.updated_at.clone(), format_timestamp(Utc::now()));
    h.store.put_node(node);

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);

    let stored = h.store.node("n1").unwrap();
    assert!(!stored.annotations.contains_key(&keys.hourly_cost));
    assert!(!stored.annotations.contains_key(&keys.updated_at));
    assert!(stored.condition(COST_CONDITION_TYPE).is_none());
    assert!(h.events.reasons().contains(&"InvalidCachedCost".to_string()));
}

#[tokio::test]
async fn test_fresh_zero_cache_is_cleared_to_unknown() {
    let h = harness(PriceLookup::Price(0.5));
    let keys = AnnotationKeys::default();
    let mut node = aws_node("n1");
    node.annotations.insert(keys.hourly_cost.clone(), "0".to_string());
    node.annotations
        .insert(keys.updated_at.clone(), format_timestamp(Utc::now()));
    h.store.put_node(node);

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    assert!(cached_cost(&h, "n1").is_none());
    assert_eq!(h.store.node_writes(), 1);
    assert_eq!(h.catalog.calls(), 0);
    assert!(h.sink.series(GaugeFamily::NodeHourlyCost).is_empty());
    assert!(h.events.reasons().contains(&"InvalidCachedCost".to_string()));

    // The cleared cache is priced on the next cycle
    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.5));
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.5000000000"));
}

#[tokio::test]
async fn test_fresh_known_node_after_restart_reloads_info_only() {
    let before = harness(PriceLookup::Price(0.5));
    before.store.put_node(aws_node("n1"));
    resolved(before.nodes.reconcile("n1").await);
    let persisted = before.store.node("n1").unwrap();

    // New process: same stored node, empty info cache
    let h = harness(PriceLookup::Price(0.9));
    h.store.put_node(persisted);
    assert!(h.info_cache.is_empty());

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.5));
    assert_eq!(h.store.node_writes(), 0);
    assert_eq!(h.catalog.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(h.catalog.describes.load(Ordering::SeqCst), 1);
    assert_eq!(h.info_cache.len(), 1);

    let hourly = h.sink.series(GaugeFamily::NodeHourlyCost);
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].0, ["n1", "m5.large", "on-demand", "i-n1", "eu-central-1a"]);
    assert_eq!(hourly[0].1, 0.5);
}

#[tokio::test]
async fn test_missing_condition_on_fresh_cache_is_rewritten() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    // Annotations landed but the condition write did not
    h.store.modify_node("n1", |n| {
        n.remove_condition(COST_CONDITION_TYPE);
    });
    let writes = h.store.node_writes();
    let calls = h.catalog.calls();

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.5));
    assert_eq!(h.store.node_writes(), writes + 1);
    assert_eq!(h.catalog.calls(), calls);
    let condition = h.store.node("n1").unwrap().condition(COST_CONDITION_TYPE).cloned().unwrap();
    assert!(condition.status);
    assert_eq!(condition.message, "costwatch hourly cost is 0.5000000000");

    resolved(h.nodes.reconcile("n1").await);
    assert_eq!(h.store.node_writes(), writes + 1);
}

#[tokio::test]
async fn test_outdated_condition_follows_cached_value() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    // A refresh to 0.6 whose condition write failed
    let keys = AnnotationKeys::default();
    h.store.modify_node("n1", |n| {
        n.annotations
            .insert(keys.hourly_cost.clone(), "0.6000000000".to_string());
        n.annotations
            .insert(keys.updated_at.clone(), format_timestamp(Utc::now()));
    });

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.6));
    let condition = h.store.node("n1").unwrap().condition(COST_CONDITION_TYPE).cloned().unwrap();
    assert!(condition.status);
    assert_eq!(condition.message, "costwatch hourly cost is 0.6000000000");
}

#[tokio::test]
async fn test_unknown_cache_repairs_condition_without_rewriting_value() {
    let h = harness(PriceLookup::Missing);
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);
    assert_eq!(h.store.node_writes(), 1);

    // Condition still claims the previous known price
    h.store.modify_node("n1", |n| {
        for c in n.conditions.iter_mut() {
            if c.condition_type == COST_CONDITION_TYPE {
                c.status = true;
            }
        }
    });

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    assert_eq!(h.store.node_writes(), 2);
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("unknown"));
    let condition = h.store.node("n1").unwrap().condition(COST_CONDITION_TYPE).cloned().unwrap();
    assert!(!condition.status);
    assert_eq!(condition.reason, "Unknown");
}

#[tokio::test]
async fn test_manual_node_price_round_trips() {
    let h = harness(PriceLookup::Missing);
    h.store.put_node(manual_node("n1", Some("0.25")));

    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Known(0.25));
    assert_eq!(cached_cost(&h, "n1").as_deref(), Some("0.2500000000"));
    assert_eq!(h.catalog.calls(), 0);

    let hourly = h.sink.series(GaugeFamily::NodeHourlyCost);
    assert_eq!(hourly[0].0[3], "manual");
}

#[tokio::test]
async fn test_deleted_node_withdraws_gauges() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);
    assert_eq!(h.info_cache.len(), 1);

    h.store.modify_node("n1", |n| n.deleting = true);
    let outcome = h.nodes.reconcile("n1").await;
    assert!(matches!(outcome, Reconciled::Success(NodeCycle::Removed)));
    assert!(h.sink.series(GaugeFamily::NodeHourlyCost).is_empty());
    assert!(h.sink.series(GaugeFamily::NodeTotalCost).is_empty());
    assert!(h.info_cache.is_empty());

    h.store.delete_node("n1");
    assert!(matches!(
        h.nodes.reconcile("n1").await,
        Reconciled::Success(NodeCycle::Removed)
    ));
}

#[tokio::test]
async fn test_store_failure_is_fatal_to_cycle() {
    let h = harness(PriceLookup::Price(0.5));
    h.store.put_node(aws_node("n1"));
    h.store.fail_updates(true);

    assert!(matches!(
        h.nodes.reconcile("n1").await,
        Reconciled::Fail(CycleError::Store(_))
    ));
    assert!(h.events.reasons().contains(&"UpdateNodeFailed".to_string()));
}

#[tokio::test]
async fn test_pod_cost_follows_allocation() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));

    let cost = published(h.pods.reconcile(&PodKey::new("default", "web-1")).await);
    assert!((cost.unit_prices.cpu_core_hourly - 0.01).abs() < 1e-12);
    assert!((cost.unit_prices.memory_mib_hourly - 0.0000097656).abs() < 1e-10);
    assert!((cost.hourly - 0.02).abs() < 1e-12);

    let requests = h.sink.series(GaugeFamily::PodRequestsHourlyCost);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, vec!["web-1", "default", "", "", "n1"]);
}

#[tokio::test]
async fn test_unknown_node_cost_publishes_nothing_for_pod() {
    let h = harness(PriceLookup::Missing);
    h.store.put_node(manual_node("n1", None));
    assert_eq!(resolved(h.nodes.reconcile("n1").await), CostValue::Unknown);
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));

    let outcome = h.pods.reconcile(&PodKey::new("default", "web-1")).await;
    assert!(matches!(outcome, Reconciled::Success(PodCycle::CostUnknown)));
    for family in GaugeFamily::POD {
        assert!(h.sink.series(family).is_empty());
    }
}

#[tokio::test]
async fn test_pod_waits_for_unprocessed_node() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_node(aws_node("n1"));
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));

    let outcome = h.pods.reconcile(&PodKey::new("default", "web-1")).await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::NodeNotProcessed));
    // Pods never price nodes themselves
    assert_eq!(h.catalog.calls(), 0);
}

#[tokio::test]
async fn test_unscheduled_pod_retries() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_pod(PodRecord::new("default", "pending"));

    let outcome = h.pods.reconcile(&PodKey::new("default", "pending")).await;
    assert_eq!(outcome.retry_reason(), Some(RetryReason::PodNotScheduled));
}

#[tokio::test]
async fn test_pod_owner_resolution_through_aggregator() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);

    let rs = OwnerRef::new("ReplicaSet", "web-7d9f");
    h.store
        .set_controller("default", &rs, OwnerRef::new("Deployment", "web"));
    let mut pod = pod_on("web-7d9f-abcde", "n1", 0.5, GIB / 2);
    pod.owners.push(rs);
    h.store.put_pod(pod);

    let cost = published(h.pods.reconcile(&PodKey::new("default", "web-7d9f-abcde")).await);
    assert_eq!(cost.owner.kind, "Deployment");
    assert_eq!(cost.owner.name, "web");
}

#[tokio::test]
async fn test_zero_allocatable_node_fails_pod_cycle() {
    let h = harness(PriceLookup::Price(0.1));
    let mut node = aws_node("n1");
    node.allocatable = Allocatable::default();
    h.store.put_node(node);
    resolved(h.nodes.reconcile("n1").await);
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));

    let outcome = h.pods.reconcile(&PodKey::new("default", "web-1")).await;
    assert!(matches!(
        outcome,
        Reconciled::Fail(CycleError::Allocation(AllocationError::NoAllocatableUnits))
    ));
    assert!(h.sink.series(GaugeFamily::PodCpuHourlyCost).is_empty());
    assert!(h.events.reasons().contains(&"CostAllocationFailed".to_string()));
}

#[tokio::test]
async fn test_rescheduled_pod_keeps_one_series_set() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_node(aws_node("n1"));
    h.store.put_node(aws_node("n2"));
    resolved(h.nodes.reconcile("n1").await);
    resolved(h.nodes.reconcile("n2").await);

    let key = PodKey::new("default", "web-1");
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));
    published(h.pods.reconcile(&key).await);

    h.store
        .modify_pod(&key, |p| p.node_name = Some("n2".to_string()));
    published(h.pods.reconcile(&key).await);

    for family in GaugeFamily::POD {
        let series = h.sink.series(family);
        assert_eq!(series.len(), 1, "{:?}", family);
        assert_eq!(series[0].0[4], "n2");
    }
}

#[tokio::test]
async fn test_pod_gauges_withdrawn_on_delete_and_node_loss() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_node(aws_node("n1"));
    resolved(h.nodes.reconcile("n1").await);
    let key = PodKey::new("default", "web-1");
    h.store.put_pod(pod_on("web-1", "n1", 1.0, GIB));
    published(h.pods.reconcile(&key).await);

    h.store.delete_node("n1");
    assert!(matches!(
        h.pods.reconcile(&key).await,
        Reconciled::Success(PodCycle::Removed)
    ));
    assert!(h.sink.series(GaugeFamily::PodRequestsHourlyCost).is_empty());

    h.store.delete_pod(&key);
    assert!(matches!(
        h.pods.reconcile(&key).await,
        Reconciled::Success(PodCycle::Removed)
    ));
}

#[tokio::test]
async fn test_pods_on_node_is_scoped_to_binding() {
    let h = harness(PriceLookup::Price(0.1));
    h.store.put_pod(pod_on("a", "n1", 1.0, GIB));
    h.store.put_pod(pod_on("b", "n2", 1.0, GIB));
    h.store.put_pod(pod_on("c", "n1", 1.0, GIB));

    let bound = h.store.pods_on_node("n1").await.unwrap();
    assert_eq!(
        bound,
        vec![PodKey::new("default", "a"), PodKey::new("default", "c")]
    );
}
