//! Typed outcome protocol shared by the controllers
//!
//! Every cycle settles into one of three states: it succeeded, it must be
//! retried (transient, never reported as an error), or it failed for a reason
//! worth logging. Retries carry a reason so callers never inspect error text.

use crate::error::{CycleError, ProviderError, StoreError};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// When a retried cycle should run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    Immediately,
    Delay(Duration),
}

/// Why a cycle asked to be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The stored version changed between read and write
    VersionConflict,
    NodeNotReady,
    PodNotScheduled,
    /// The provider has no price yet but will have one
    PriceNotReady,
    /// The bound node has not been through a node cycle yet
    NodeNotProcessed,
    Timeout,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::VersionConflict => "version_conflict",
            RetryReason::NodeNotReady => "node_not_ready",
            RetryReason::PodNotScheduled => "pod_not_scheduled",
            RetryReason::PriceNotReady => "price_not_ready",
            RetryReason::NodeNotProcessed => "node_not_processed",
            RetryReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub reason: RetryReason,
    pub after: RetryAfter,
}

impl Retry {
    pub fn now(reason: RetryReason) -> Self {
        Self {
            reason,
            after: RetryAfter::Immediately,
        }
    }

    pub fn after(reason: RetryReason, delay: Duration) -> Self {
        Self {
            reason,
            after: RetryAfter::Delay(delay),
        }
    }
}

/// Result of one step of a reconciliation cycle
#[must_use]
#[derive(Debug)]
pub enum Reconciled<T> {
    Success(T),
    Retry(Retry),
    Fail(CycleError),
}

impl<T> Reconciled<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reconciled<U> {
        match self {
            Reconciled::Success(v) => Reconciled::Success(f(v)),
            Reconciled::Retry(r) => Reconciled::Retry(r),
            Reconciled::Fail(e) => Reconciled::Fail(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reconciled::Success(_))
    }

    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            Reconciled::Retry(r) => Some(r.reason),
            _ => None,
        }
    }

    /// Classify a store failure: timeouts retry after `delay`, anything else fails
    pub fn from_store(err: StoreError, delay: Duration) -> Self {
        match err {
            StoreError::Timeout => Reconciled::Retry(Retry::after(RetryReason::Timeout, delay)),
            other => Reconciled::Fail(other.into()),
        }
    }

    pub fn from_provider(err: ProviderError, delay: Duration) -> Self {
        match err {
            ProviderError::Timeout => {
                Reconciled::Retry(Retry::after(RetryReason::Timeout, delay))
            }
            other => Reconciled::Fail(other.into()),
        }
    }
}

/// Unwrap a `Reconciled::Success` or return the retry/failure from the caller
#[macro_export]
macro_rules! settle {
    ($e:expr) => {
        match $e {
            $crate::reconcile::Reconciled::Success(v) => v,
            $crate::reconcile::Reconciled::Retry(r) => {
                return $crate::reconcile::Reconciled::Retry(r)
            }
            $crate::reconcile::Reconciled::Fail(e) => {
                return $crate::reconcile::Reconciled::Fail(e)
            }
        }
    };
}

/// What the scheduler should do with a key after its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Stop quietly until the next change notification
    Done,
    RequeueAfter(Duration),
    RequeueNow,
}

impl From<RetryAfter> for Action {
    fn from(after: RetryAfter) -> Self {
        match after {
            RetryAfter::Immediately => Action::RequeueNow,
            RetryAfter::Delay(d) => Action::RequeueAfter(d),
        }
    }
}

/// Run an external call under a caller supplied deadline
///
/// An elapsed deadline is folded into the call's own error type.
pub async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<tokio::time::error::Elapsed>,
{
    tokio::time::timeout(limit, call).await?
}
