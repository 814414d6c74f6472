//! Per-cluster coalescing work queue
//!
//! Each cluster has at most one slot: queued, running, or running with a
//! newer trigger pending. Triggers for a queued cluster are absorbed; a
//! trigger that arrives while its pass runs re-queues the cluster exactly
//! once when the pass completes. Delayed requeues keep only the earliest
//! deadline per cluster and are dropped as soon as a pass for that cluster
//! starts.

use crate::cluster::ClusterRef;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Running,
    RunningDirty,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<ClusterRef, Slot>,
    ready: VecDeque<ClusterRef>,
    /// Pending delayed requeue per cluster: deadline and timer id
    delayed: HashMap<ClusterRef, (Instant, u64)>,
    next_timer: u64,
}

/// Work queue serializing passes per cluster
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass for `key`
    pub fn enqueue(&self, key: ClusterRef) {
        let mut state = self.state.lock();
        match state.slots.get(&key).copied() {
            None => {
                debug!(cluster = %key, "Queued");
                state.slots.insert(key.clone(), Slot::Queued);
                state.ready.push_back(key);
                drop(state);
                self.notify.notify_one();
            }
            Some(Slot::Running) => {
                state.slots.insert(key, Slot::RunningDirty);
            }
            Some(Slot::Queued) | Some(Slot::RunningDirty) => {}
        }
    }

    /// Request a pass for `key` once `delay` has elapsed
    ///
    /// A pending earlier deadline for the same cluster wins.
    pub fn enqueue_after(self: &Arc<Self>, key: ClusterRef, delay: Duration, cancel: &CancellationToken) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let timer = {
            let mut state = self.state.lock();
            if let Some((existing, _)) = state.delayed.get(&key) {
                if *existing <= deadline {
                    return;
                }
            }
            state.next_timer += 1;
            let timer = state.next_timer;
            state.delayed.insert(key.clone(), (deadline, timer));
            timer
        };

        let queue = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => queue.fire(key, timer),
            }
        });
    }

    fn fire(&self, key: ClusterRef, timer: u64) {
        let current = {
            let mut state = self.state.lock();
            match state.delayed.get(&key) {
                Some((_, id)) if *id == timer => {
                    state.delayed.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if current {
            self.enqueue(key);
        }
    }

    /// Wait for the next cluster to process, `None` on cancellation
    pub async fn next(&self, cancel: &CancellationToken) -> Option<ClusterRef> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.ready.pop_front() {
                    state.slots.insert(key.clone(), Slot::Running);
                    state.delayed.remove(&key);
                    return Some(key);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Mark the pass for `key` as finished
    pub fn complete(&self, key: &ClusterRef) {
        let mut state = self.state.lock();
        if state.slots.remove(key) == Some(Slot::RunningDirty) {
            state.slots.insert(key.clone(), Slot::Queued);
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clusters waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a delayed requeue is pending for `key`
    pub fn is_scheduled(&self, key: &ClusterRef) -> bool {
        self.state.lock().delayed.contains_key(key)
    }
}

/// Run `workers` workers draining `queue` until `cancel` fires
///
/// `handler` runs one pass and returns when the cluster should be revisited.
pub async fn run_workers<F, Fut>(
    queue: Arc<WorkQueue>,
    workers: usize,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(ClusterRef) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let mut set = JoinSet::new();
    for id in 0..workers.max(1) {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let handler = Arc::clone(&handler);
        set.spawn(async move {
            while let Some(key) = queue.next(&cancel).await {
                let requeue = handler(key.clone()).await;
                queue.complete(&key);
                if let Some(delay) = requeue {
                    queue.enqueue_after(key, delay, &cancel);
                }
            }
            debug!(worker = id, "Worker stopped");
        });
    }
    while set.join_next().await.is_some() {}
    info!("All workers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> ClusterRef {
        ClusterRef::new(ClusterKind::Broker, "mqtt", name)
    }

    #[tokio::test]
    async fn test_enqueue_while_queued_coalesces() {
        let queue = WorkQueue::new();
        queue.enqueue(key("a"));
        queue.enqueue(key("a"));
        queue.enqueue(key("b"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_while_running_requeues_once() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(key("a"));
        let running = queue.next(&cancel).await.unwrap();
        assert!(queue.is_empty());

        queue.enqueue(key("a"));
        queue.enqueue(key("a"));
        queue.enqueue(key("a"));
        assert!(queue.is_empty());

        queue.complete(&running);
        assert_eq!(queue.len(), 1);
        let again = queue.next(&cancel).await.unwrap();
        queue.complete(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_returns_none_on_cancel() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.next(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_keeps_earliest() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        queue.enqueue_after(key("a"), Duration::from_secs(30), &cancel);
        queue.enqueue_after(key("a"), Duration::from_secs(300), &cancel);
        assert!(queue.is_scheduled(&key("a")));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.len(), 1);
        let k = queue.next(&cancel).await.unwrap();
        queue.complete(&k);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_start_drops_pending_timer() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        queue.enqueue_after(key("a"), Duration::from_secs(10), &cancel);
        queue.enqueue(key("a"));
        let k = queue.next(&cancel).await.unwrap();
        assert!(!queue.is_scheduled(&k));
        queue.complete(&k);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_never_overlap_same_cluster() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let handler = {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let passes = Arc::clone(&passes);
            move |_key: ClusterRef| {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let passes = Arc::clone(&passes);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    passes.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }
        };
        let workers = tokio::spawn(run_workers(Arc::clone(&queue), 4, cancel.clone(), handler));

        queue.enqueue(key("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..10 {
            queue.enqueue(key("a"));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        cancel.cancel();
        workers.await.unwrap();
    }
}
