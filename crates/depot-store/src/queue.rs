//! Bounded-concurrency admission queue for network requests.
//!
//! The queue serializes only admission: once admitted, tasks run
//! concurrently up to the configured budget. Higher priority is admitted
//! first; equal priorities are FIFO. A waiter dropped before admission is
//! skipped when its turn comes.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Magnitude of the rotated download priorities.
pub const DOWNLOAD_PRIORITY_UNIT: i32 = 1000;

/// Compute the admission priority for the `counter`-th download.
///
/// Most downloads get `+1000` so tarball transfers saturate the budget;
/// every `concurrency`-th download is deferred to `-1000`, reserving one
/// slot's worth of turnover for the lighter metadata requests that share
/// the queue (those default to priority 0).
#[must_use]
pub fn rotation_priority(counter: u64, concurrency: u64) -> i32 {
    if concurrency > 0 && counter % concurrency == 0 {
        -DOWNLOAD_PRIORITY_UNIT
    } else {
        DOWNLOAD_PRIORITY_UNIT
    }
}

struct Waiter {
    priority: i32,
    seq: u64,
    slot: oneshot::Sender<SlotGuard>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: highest priority first, lowest sequence (oldest) within
        // a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    running: usize,
    seq: u64,
    waiting: BinaryHeap<Waiter>,
}

struct QueueInner {
    concurrency: usize,
    counter: AtomicU64,
    state: Mutex<QueueState>,
}

impl QueueInner {
    /// Hand the freed slot to the next live waiter, or mark it free.
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock().expect("queue state poisoned");
                match state.waiting.pop() {
                    Some(waiter) => waiter,
                    None => {
                        state.running -= 1;
                        return;
                    }
                }
            };
            let guard = SlotGuard {
                inner: Some(Arc::clone(self)),
            };
            match waiter.slot.send(guard) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Waiter gave up; keep the slot and try the next one.
                    unclaimed.inner = None;
                }
            }
        }
    }
}

/// An admitted slot; releases on drop.
struct SlotGuard {
    inner: Option<Arc<QueueInner>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

/// Process-wide request scheduler.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Create a queue admitting at most `concurrency` tasks at a time.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                concurrency: concurrency.max(1),
                counter: AtomicU64::new(0),
                state: Mutex::new(QueueState {
                    running: 0,
                    seq: 0,
                    waiting: BinaryHeap::new(),
                }),
            }),
        }
    }

    /// Run `task` once a slot is free. Admission order follows priority,
    /// then submission order.
    pub async fn submit<F, T>(&self, priority: i32, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire(priority).await;
        task.await
    }

    /// The priority for the next tarball download, per the rotation policy.
    pub fn next_download_priority(&self) -> i32 {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        rotation_priority(n, self.inner.concurrency as u64)
    }

    async fn acquire(&self, priority: i32) -> SlotGuard {
        let rx = {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            if state.running < self.inner.concurrency {
                state.running += 1;
                return SlotGuard {
                    inner: Some(Arc::clone(&self.inner)),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.seq += 1;
            let seq = state.seq;
            state.waiting.push(Waiter {
                priority,
                seq,
                slot: tx,
            });
            rx
        };
        // The sender lives in the queue state, which outlives this borrow.
        rx.await.expect("queue slot sender dropped")
    }
}
