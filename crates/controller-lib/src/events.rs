//! Events attached to nodes and pods
//!
//! User-visible failures surface as events on the affected object. The
//! recorder is a trait so the controllers stay independent of the cluster
//! API; a deduplicating wrapper keeps repeated warnings from flooding it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Object an event is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectReference {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: "Node".to_string(),
            name: name.into(),
            namespace: None,
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: "Pod".to_string(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

impl CostEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Sink for object events; publishing never fails the caller
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, target: &ObjectReference, event: CostEvent);
}

/// Recorder that only writes events to the log
#[derive(Debug, Default, Clone)]
pub struct LogRecorder;

#[async_trait]
impl EventRecorder for LogRecorder {
    async fn publish(&self, target: &ObjectReference, event: CostEvent) {
        match event.event_type {
            EventType::Warning => warn!(
                event = "object_event",
                kind = %target.kind,
                name = %target.name,
                namespace = ?target.namespace,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventType::Normal => info!(
                event = "object_event",
                kind = %target.kind,
                name = %target.name,
                namespace = ?target.namespace,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Recorder that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<(ObjectReference, CostEvent)>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ObjectReference, CostEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|(_, e)| e.reason)
            .collect()
    }

    pub fn warnings(&self) -> usize {
        self.events()
            .iter()
            .filter(|(_, e)| e.event_type == EventType::Warning)
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn publish(&self, target: &ObjectReference, event: CostEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((target.clone(), event));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    target: ObjectReference,
    reason: String,
    message: String,
}

/// Drops an event identical to one published within the window
pub struct DedupRecorder<R> {
    inner: R,
    dedup_window: Duration,
    recent: RwLock<HashMap<DedupKey, Instant>>,
}

impl<R: EventRecorder> DedupRecorder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            recent: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    fn should_suppress(&self, key: &DedupKey) -> bool {
        match self.recent.read() {
            Ok(recent) => recent
                .get(key)
                .map(|last| last.elapsed() < self.dedup_window)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn remember(&self, key: DedupKey) {
        if let Ok(mut recent) = self.recent.write() {
            recent.insert(key, Instant::now());
            recent.retain(|_, at| at.elapsed() < self.dedup_window);
        }
    }
}

#[async_trait]
impl<R: EventRecorder> EventRecorder for DedupRecorder<R> {
    async fn publish(&self, target: &ObjectReference, event: CostEvent) {
        let key = DedupKey {
            target: target.clone(),
            reason: event.reason.clone(),
            message: event.message.clone(),
        };
        if self.should_suppress(&key) {
            return;
        }
        self.remember(key);
        self.inner.publish(target, event).await;
    }
}

#[async_trait]
impl<R: EventRecorder + ?Sized> EventRecorder for std::sync::Arc<R> {
    async fn publish(&self, target: &ObjectReference, event: CostEvent) {
        (**self).publish(target, event).await
    }
}
