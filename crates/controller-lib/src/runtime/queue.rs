//! Deduplicating work queue
//!
//! A key is either waiting, delayed, in flight, or absent. Adding a key that
//! is in flight marks it dirty instead of queueing it a second time; it is
//! put back when its current cycle finishes, so cycles for one identity
//! never overlap. An immediate add leaves a pending deadline in place, so
//! event traffic never postpones a scheduled refresh.

use crate::models::ObjectKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    delayed: HashMap<ObjectKey, Instant>,
    shut_down: bool,
}

impl QueueState {
    /// Make `key` runnable now; returns whether a worker should be woken
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) -> bool {
        let due: Vec<ObjectKey> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut woke = false;
        for key in due {
            self.delayed.remove(&key);
            woke |= self.push(key);
        }
        woke
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` for an immediate cycle
    ///
    /// A delayed requeue of the same key keeps its deadline.
    pub async fn add(&self, key: ObjectKey) {
        let woke = self.state.lock().await.push(key);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`, keeping the earliest deadline if one is pending
    pub async fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            return self.add(key).await;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().await;
        if state.queued.contains(&key) {
            return;
        }
        state
            .delayed
            .entry(key)
            .and_modify(|at| *at = (*at).min(deadline))
            .or_insert(deadline);
        drop(state);
        // A sleeping worker may need to wake earlier than it planned
        self.notify.notify_one();
    }

    /// Wait for the next runnable key and mark it in flight
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let deadline = {
                let mut state = self.state.lock().await;
                if state.shut_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Release `key` after its cycle; a key marked dirty meanwhile is queued again
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);
        let woke = state.dirty.remove(key) && state.push(key.clone());
        drop(state);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Distinct keys waiting, runnable or delayed
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        let delayed_only = state
            .delayed
            .keys()
            .filter(|k| !state.queued.contains(*k))
            .count();
        state.ready.len() + delayed_only
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wake every waiting worker and make `next` return `None`
    pub async fn shutdown(&self) {
        self.state.lock().await.shut_down = true;
        self.notify.notify_waiters();
        // Covers a worker that is between its state check and its wait
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn node(name: &str) -> ObjectKey {
        ObjectKey::Node(name.to_string())
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add(node("a")).await;
        queue.add(node("a")).await;
        queue.add(node("b")).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.next().await, Some(node("a")));
        assert_eq!(queue.next().await, Some(node("b")));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_flight_key_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(node("a")).await;
        let key = queue.next().await.unwrap();

        // Changed while its cycle runs
        queue.add(node("a")).await;
        assert!(queue.is_empty().await);

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next().await, Some(node("a")));
    }

    #[tokio::test]
    async fn test_done_without_changes_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(node("a")).await;
        let key = queue.next().await.unwrap();
        queue.done(&key).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_delayed_key_keeps_earliest_deadline() {
        let queue = WorkQueue::new();
        queue.add_after(node("a"), Duration::from_millis(20)).await;
        queue.add_after(node("a"), Duration::from_secs(3600)).await;
        assert_eq!(queue.len().await, 1);

        let key = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .expect("delayed key never became runnable");
        assert_eq!(key, Some(node("a")));
    }

    #[tokio::test]
    async fn test_add_keeps_pending_deadline() {
        let queue = WorkQueue::new();
        queue.add_after(node("a"), Duration::from_millis(50)).await;
        queue.add(node("a")).await;
        assert_eq!(queue.len().await, 1);

        let key = queue.next().await.unwrap();
        queue.done(&key).await;
        // The refresh scheduled before the event still fires on time
        queue.add_after(node("a"), Duration::from_secs(3600)).await;
        assert_eq!(queue.len().await, 1);

        let key = tokio::time::timeout(Duration::from_secs(2), queue.next())
            .await
            .expect("pending deadline was pushed back");
        assert_eq!(key, Some(node("a")));
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.add(node("a")).await;

        let key = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, Some(node("a")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown().await;

        let key = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, None);
    }
}
