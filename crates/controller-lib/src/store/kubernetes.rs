//! Object store backed by the Kubernetes API
//!
//! Nodes and pods are converted into plain records at the edge so the
//! controllers never see `k8s-openapi` types.

use super::quantity::{parse_cpu, parse_memory};
use super::{ChangeEvent, ObjectStore, UpdateOutcome, CHANGE_CHANNEL_CAPACITY};
use crate::annotations::COST_CONDITION_TYPE;
use crate::error::StoreError;
use crate::events::{CostEvent, EventRecorder, EventType, ObjectReference};
use crate::health::{components, HealthRegistry};
use crate::models::{
    Allocatable, ContainerAllocation, NodeCondition, NodeRecord, OwnerRef, PodKey, PodRecord,
    Version,
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition as KubeNodeCondition, ObjectReference as KubeObjectReference, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

const FIELD_MANAGER: &str = "costwatch";

fn store_error(err: kube::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

pub struct KubeStore {
    client: Client,
    events: broadcast::Sender<ChangeEvent>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { client, events }
    }

    /// Start the node and pod watchers feeding [`ObjectStore::subscribe`]
    pub fn spawn_watchers(
        &self,
        health: HealthRegistry,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::all(self.client.clone());

        vec![
            tokio::spawn(watch(
                "nodes",
                nodes,
                self.events.clone(),
                health.clone(),
                shutdown.subscribe(),
                node_events,
            )),
            tokio::spawn(watch(
                "pods",
                pods,
                self.events.clone(),
                health,
                shutdown.subscribe(),
                pod_events,
            )),
        ]
    }

    async fn lookup_controller<K>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerRef>, StoreError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let object = api.get_opt(name).await.map_err(store_error)?;
        Ok(object.and_then(|o| controlling_owner(o.meta())))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_node(&self, name: &str) -> Result<Option<NodeRecord>, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api.get_opt(name).await.map_err(store_error)?;
        Ok(node.as_ref().map(node_record))
    }

    async fn get_pod(&self, key: &PodKey) -> Result<Option<PodRecord>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let pod = api.get_opt(&key.name).await.map_err(store_error)?;
        Ok(pod.as_ref().map(pod_record))
    }

    async fn update_node(
        &self,
        node: &NodeRecord,
        expected: &Version,
    ) -> Result<UpdateOutcome, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let Some(mut current) = api.get_opt(&node.name).await.map_err(store_error)? else {
            return Err(StoreError::NotFound {
                kind: "node",
                name: node.name.clone(),
            });
        };
        if current.metadata.resource_version.as_deref() != Some(expected.0.as_str()) {
            return Ok(UpdateOutcome::Conflict);
        }

        let had_condition = current
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == COST_CONDITION_TYPE))
            .unwrap_or(false);

        // The annotation replace is the atomic cache write; the API server
        // rejects it with 409 if anyone wrote since `expected`.
        current.metadata.annotations = Some(node.annotations.clone());
        current.metadata.resource_version = Some(expected.0.clone());
        let replaced = match api
            .replace(&node.name, &PostParams::default(), &current)
            .await
        {
            Ok(n) => n,
            Err(e) if is_status(&e, 409) => return Ok(UpdateOutcome::Conflict),
            Err(e) if is_status(&e, 404) => {
                return Err(StoreError::NotFound {
                    kind: "node",
                    name: node.name.clone(),
                })
            }
            Err(e) => return Err(store_error(e)),
        };

        let patch = match node.condition(COST_CONDITION_TYPE) {
            Some(condition) => Some(json!({
                "status": { "conditions": [condition_json(condition)] }
            })),
            None if had_condition => Some(json!({
                "status": { "conditions": [{ "type": COST_CONDITION_TYPE, "$patch": "delete" }] }
            })),
            None => None,
        };

        let mut version = replaced.metadata.resource_version.unwrap_or_default();
        if let Some(patch) = patch {
            // Conditions merge by type, so this never clobbers other writers.
            // If this fails the annotations are already stored; the node
            // controller compares the condition on every cycle and rewrites it.
            let patched = api
                .patch_status(
                    &node.name,
                    &PatchParams::default(),
                    &Patch::Strategic(patch),
                )
                .await
                .map_err(store_error)?;
            version = patched.metadata.resource_version.unwrap_or(version);
        }

        Ok(UpdateOutcome::Updated(Version(version)))
    }

    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodKey>, StoreError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = api.list(&params).await.map_err(store_error)?;
        Ok(pods.items.iter().map(pod_key).collect())
    }

    async fn controller_of(
        &self,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Option<OwnerRef>, StoreError> {
        match owner.kind.as_str() {
            "ReplicaSet" => self.lookup_controller::<ReplicaSet>(namespace, &owner.name).await,
            "Job" => self.lookup_controller::<Job>(namespace, &owner.name).await,
            _ => Ok(None),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

async fn watch<K, F>(
    resource: &'static str,
    api: Api<K>,
    events: broadcast::Sender<ChangeEvent>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
    convert: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(watcher::Event<K>) -> Vec<ChangeEvent> + Send + 'static,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    info!(resource = resource, "Watching for changes");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(resource = resource, "Watcher stopping");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    for change in convert(event) {
                        let _ = events.send(change);
                    }
                }
                Some(Err(e)) => {
                    warn!(resource = resource, error = %e, "Watch error, backing off");
                    health
                        .set_degraded(components::OBJECT_STORE, format!("{} watch: {}", resource, e))
                        .await;
                }
                None => {
                    health
                        .set_unhealthy(components::OBJECT_STORE, format!("{} watch ended", resource))
                        .await;
                    break;
                }
            }
        }
    }
}

fn node_events(event: watcher::Event<Node>) -> Vec<ChangeEvent> {
    match event {
        watcher::Event::Applied(node) => vec![ChangeEvent::Node(node_record(&node))],
        watcher::Event::Deleted(node) => {
            vec![ChangeEvent::NodeDeleted(node.metadata.name.unwrap_or_default())]
        }
        watcher::Event::Restarted(nodes) => std::iter::once(ChangeEvent::Resync)
            .chain(nodes.iter().map(|n| ChangeEvent::Node(node_record(n))))
            .collect(),
    }
}

fn pod_events(event: watcher::Event<Pod>) -> Vec<ChangeEvent> {
    match event {
        watcher::Event::Applied(pod) => vec![ChangeEvent::Pod(pod_key(&pod))],
        watcher::Event::Deleted(pod) => vec![ChangeEvent::PodDeleted(pod_key(&pod))],
        watcher::Event::Restarted(pods) => pods.iter().map(|p| ChangeEvent::Pod(pod_key(p))).collect(),
    }
}

fn controlling_owner(meta: &ObjectMeta) -> Option<OwnerRef> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller.unwrap_or(false))
        .map(owner_ref)
}

fn owner_ref(o: &OwnerReference) -> OwnerRef {
    OwnerRef {
        kind: o.kind.clone(),
        name: o.name.clone(),
        controller: o.controller.unwrap_or(false),
    }
}

fn condition_json(c: &NodeCondition) -> serde_json::Value {
    let now = Utc::now();
    json!({
        "type": c.condition_type,
        "status": if c.status { "True" } else { "False" },
        "reason": c.reason,
        "message": c.message,
        "lastHeartbeatTime": c.last_heartbeat.unwrap_or(now).to_rfc3339(),
        "lastTransitionTime": c.last_transition.unwrap_or(now).to_rfc3339(),
    })
}

fn record_condition(c: &KubeNodeCondition) -> NodeCondition {
    NodeCondition {
        condition_type: c.type_.clone(),
        status: c.status == "True",
        reason: c.reason.clone().unwrap_or_default(),
        message: c.message.clone().unwrap_or_default(),
        last_heartbeat: c.last_heartbeat_time.as_ref().map(|t| t.0),
        last_transition: c.last_transition_time.as_ref().map(|t| t.0),
    }
}

/// Convert an API node into the controller's view of it
pub(crate) fn node_record(node: &Node) -> NodeRecord {
    let meta = &node.metadata;
    let status = node.status.as_ref();

    let allocatable = status
        .and_then(|s| s.allocatable.as_ref())
        .map(|a| Allocatable {
            cpu_cores: a.get("cpu").and_then(|q| parse_cpu(&q.0)).unwrap_or(0.0),
            memory_bytes: a.get("memory").and_then(|q| parse_memory(&q.0)).unwrap_or(0),
        })
        .unwrap_or_default();

    let conditions: Vec<NodeCondition> = status
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().map(record_condition).collect())
        .unwrap_or_default();
    let ready = conditions
        .iter()
        .any(|c| c.condition_type == "Ready" && c.status);

    NodeRecord {
        name: meta.name.clone().unwrap_or_default(),
        provider_id: node
            .spec
            .as_ref()
            .and_then(|s| s.provider_id.clone())
            .unwrap_or_default(),
        allocatable,
        ready,
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        conditions,
        created_at: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        deleting: meta.deletion_timestamp.is_some(),
        version: Version(meta.resource_version.clone().unwrap_or_default()),
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    PodKey::new(
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

type Resources = BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>;

fn allocation(name: &str, resources: &Resources) -> ContainerAllocation {
    ContainerAllocation {
        name: name.to_string(),
        cpu_cores: resources
            .get("cpu")
            .and_then(|q| parse_cpu(&q.0))
            .unwrap_or(0.0),
        memory_bytes: resources
            .get("memory")
            .and_then(|q| parse_memory(&q.0))
            .unwrap_or(0),
    }
}

/// Convert an API pod; allocation prefers `allocatedResources` over requests
pub(crate) fn pod_record(pod: &Pod) -> PodRecord {
    let meta = &pod.metadata;
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    let containers = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .map(|c| {
                    let allocated = statuses
                        .and_then(|ss| ss.iter().find(|s| s.name == c.name))
                        .and_then(|s| s.allocated_resources.as_ref());
                    let requested = c.resources.as_ref().and_then(|r| r.requests.as_ref());
                    match allocated.or(requested) {
                        Some(resources) => allocation(&c.name, resources),
                        None => ContainerAllocation {
                            name: c.name.clone(),
                            ..Default::default()
                        },
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    PodRecord {
        key: pod_key(pod),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .filter(|n| !n.is_empty()),
        containers,
        owners: meta
            .owner_references
            .as_ref()
            .map(|os| os.iter().map(owner_ref).collect())
            .unwrap_or_default(),
        created_at: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        deleting: meta.deletion_timestamp.is_some(),
        version: Version(meta.resource_version.clone().unwrap_or_default()),
    }
}

/// Publishes object events through the events.k8s.io API
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, target: &ObjectReference, event: CostEvent) {
        let reference = KubeObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some(target.kind.clone()),
            name: Some(target.name.clone()),
            namespace: target.namespace.clone(),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let type_ = match event.event_type {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };

        if let Err(e) = recorder
            .publish(KubeEvent {
                type_,
                reason: event.reason.clone(),
                note: Some(event.message),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
        {
            warn!(
                kind = %target.kind,
                name = %target.name,
                reason = %event.reason,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerStatus, NodeSpec, NodeStatus, PodSpec, PodStatus,
        ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn quantities(cpu: &str, memory: &str) -> Resources {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    }

    #[test]
    fn test_node_record_conversion() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("ip-10-0-0-1".to_string()),
                resource_version: Some("42".to_string()),
                annotations: Some(BTreeMap::from([(
                    "costwatch.io/node-hourly-cost".to_string(),
                    "0.5000000000".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("aws:///eu-central-1a/i-0abc".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                allocatable: Some(quantities("1930m", "7Gi")),
                conditions: Some(vec![KubeNodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let record = node_record(&node);
        assert_eq!(record.name, "ip-10-0-0-1");
        assert_eq!(record.version, Version::new("42"));
        assert_eq!(record.provider_id, "aws:///eu-central-1a/i-0abc");
        assert!(record.ready);
        assert!((record.allocatable.cpu_cores - 1.93).abs() < 1e-9);
        assert_eq!(record.allocatable.memory_bytes, 7 * 1024 * 1024 * 1024);
        assert_eq!(record.annotations.len(), 1);
        assert!(!record.deleting);
    }

    #[test]
    fn test_node_without_status_is_not_ready() {
        let record = node_record(&Node::default());
        assert!(!record.ready);
        assert_eq!(record.allocatable, Allocatable::default());
    }

    #[test]
    fn test_pod_record_prefers_allocated_resources() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("default".to_string()),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "web-7d9f".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities("100m", "128Mi")),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_string(),
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities("50m", "64Mi")),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    allocated_resources: Some(quantities("500m", "256Mi")),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let record = pod_record(&pod);
        assert_eq!(record.key, PodKey::new("default", "web-1"));
        assert_eq!(record.node_name.as_deref(), Some("n1"));
        assert_eq!(record.owners[0].kind, "ReplicaSet");
        assert!(record.owners[0].controller);

        let total = record.allocated();
        assert!((total.cpu_cores - 0.55).abs() < 1e-9);
        assert_eq!(total.memory_bytes, (256 + 64) * 1024 * 1024);
    }

    #[test]
    fn test_unscheduled_pod_has_no_binding() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("pending".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(String::new()),
                ..Default::default()
            }),
            status: None,
        };
        assert!(pod_record(&pod).node_name.is_none());
    }

    #[test]
    fn test_restart_emits_resync_then_nodes() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let changes = node_events(watcher::Event::Restarted(vec![node]));
        assert!(matches!(changes[0], ChangeEvent::Resync));
        assert!(matches!(&changes[1], ChangeEvent::Node(n) if n.name == "n1"));
    }

    #[test]
    fn test_condition_json_shape() {
        let value = condition_json(&NodeCondition {
            condition_type: COST_CONDITION_TYPE.to_string(),
            status: false,
            reason: "Unknown".to_string(),
            message: "costwatch: hourly cost unknown".to_string(),
            last_heartbeat: None,
            last_transition: None,
        });
        assert_eq!(value["type"], "HourlyCostKnown");
        assert_eq!(value["status"], "False");
        assert!(value["lastHeartbeatTime"].is_string());
    }
}
