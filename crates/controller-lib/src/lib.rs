//! Cost reconciliation library for Kubernetes nodes and pods
//!
//! This crate provides the core functionality for:
//! - Pricing nodes through cloud or operator supplied prices
//! - Caching node prices in node annotations under optimistic concurrency
//! - Splitting node prices across the pods bound to them
//! - Publishing cost gauges, events, health and self-metrics

#[macro_use]
pub mod reconcile;

pub mod allocation;
pub mod annotations;
pub mod controller;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod pricing;
pub mod runtime;
pub mod sink;
pub mod store;

pub use controller::{ControllerSettings, NodeController, NodeInfoCache, PodController};
pub use error::{AllocationError, CycleError, ProviderError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
pub use reconcile::{Action, Reconciled, Retry, RetryAfter, RetryReason};
pub use runtime::{Dispatcher, Runner, RunnerConfig, WorkQueue};
