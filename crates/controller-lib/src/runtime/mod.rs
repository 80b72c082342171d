//! Scheduling of reconciliation cycles
//!
//! - [`WorkQueue`]: per-identity deduplication and serialization
//! - [`Dispatcher`]: store notifications to queued keys
//! - [`Runner`]: bounded worker pool executing cycles

mod dispatch;
mod queue;
mod runner;

pub use dispatch::Dispatcher;
pub use queue::WorkQueue;
pub use runner::{Runner, RunnerConfig};
