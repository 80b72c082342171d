//! Display owner resolution for pods
//!
//! Pods are usually created by an intermediate object (a ReplicaSet or a
//! Job) that is itself controlled by what an operator thinks of as the
//! workload. Resolution follows at most one extra hop.

use crate::models::{OwnerRef, PodRecord};
use crate::reconcile::{bounded, Reconciled};
use crate::store::ObjectStore;
use std::time::Duration;

/// Owner identity published with pod gauges; empty fields when unowned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayOwner {
    pub kind: String,
    pub name: String,
}

impl From<&OwnerRef> for DisplayOwner {
    fn from(owner: &OwnerRef) -> Self {
        Self {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        }
    }
}

/// Kinds that sit between a pod and the workload that manages it
pub fn is_aggregator(kind: &str) -> bool {
    matches!(kind, "ReplicaSet" | "Job")
}

/// Resolve the owner to publish for `pod`
///
/// pod -> aggregator -> controller resolves to the controller; any other
/// direct owner, or an aggregator without a controller, resolves to itself.
pub async fn resolve_owner(
    store: &dyn ObjectStore,
    pod: &PodRecord,
    timeout: Duration,
    retry_delay: Duration,
) -> Reconciled<DisplayOwner> {
    let Some(direct) = pod.direct_owner() else {
        return Reconciled::Success(DisplayOwner::default());
    };
    if !is_aggregator(&direct.kind) {
        return Reconciled::Success(direct.into());
    }

    match bounded(timeout, store.controller_of(&pod.key.namespace, direct)).await {
        Ok(Some(parent)) => Reconciled::Success((&parent).into()),
        Ok(None) => Reconciled::Success(direct.into()),
        Err(e) => Reconciled::from_store(e, retry_delay),
    }
}
