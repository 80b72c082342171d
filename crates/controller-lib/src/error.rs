//! Error types shared by the store, providers and controllers

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Failures reported by an object store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store call timed out")]
    Timeout,

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("object store error: {0}")]
    Backend(String),
}

impl From<Elapsed> for StoreError {
    fn from(_: Elapsed) -> Self {
        StoreError::Timeout
    }
}

/// Failures reported by a pricing provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("pricing provider call timed out")]
    Timeout,

    /// The provider answered but the data it needs is absent or malformed
    #[error("pricing data missing: {0}")]
    MissingData(String),

    #[error("pricing backend error: {0}")]
    Backend(String),
}

impl From<Elapsed> for ProviderError {
    fn from(_: Elapsed) -> Self {
        ProviderError::Timeout
    }
}

/// Invalid inputs to the allocation algorithm
#[derive(Debug, Error, PartialEq)]
pub enum AllocationError {
    #[error("node reports no allocatable cpu or memory")]
    NoAllocatableUnits,

    #[error("invalid node hourly price {0}")]
    InvalidPrice(f64),
}

/// Error that aborts a reconciliation cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
