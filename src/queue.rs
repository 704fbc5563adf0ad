// src/queue.rs - Bounded bulk blocking queue
//
// Core features:
// - MPMC with strict FIFO order
// - Batch pop: wait for a minimum count, drain up to a maximum
// - Overflow policy: with a drop fn, the oldest half is dropped through
//   it before a new element is accepted; without one, producers block
// - Warning log at most once per second per queue when the threshold
//   is crossed

use log::warn;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::time::monotonic_ms;

const WARN_INTERVAL_MS: u64 = 1000;

type DropFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Outcome of [`BlockingQueue::pop_front`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopStatus {
    /// At least `min_n` items were delivered.
    Ready,
    /// The minimum count was not reached within the wait bound (any
    /// items present at the deadline are still drained into `out`).
    TimedOut,
}

struct Inner<T> {
    items: VecDeque<T>,
    drop_fn: Option<DropFn<T>>,
    warning_threshold: usize,
    last_warn_ms: u64,
    in_flight: usize,
    stopped: bool,
}

/// Bounded multi-producer / multi-consumer queue with batched dequeue.
///
/// `limit == 0` disables the bound. All waiters wake on push and on
/// [`stop`](Self::stop); after stop, `pop_front` times out immediately.
pub struct BlockingQueue<T> {
    name: String,
    limit: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        Self {
            name: name.into(),
            limit,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                drop_fn: None,
                warning_threshold: usize::MAX,
                last_warn_ms: 0,
                in_flight: 0,
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install the overflow drop handler; dropped items are passed to it
    /// oldest first.
    pub fn set_drop_fn(&self, f: impl Fn(T) + Send + Sync + 'static) {
        self.lock().drop_fn = Some(Box::new(f));
    }

    pub fn set_warning_threshold(&self, threshold: usize) {
        self.lock().warning_threshold = if threshold == 0 {
            usize::MAX
        } else {
            threshold
        };
    }

    fn warn_if_over_threshold(name: &str, inner: &mut Inner<T>) {
        if inner.items.len() <= inner.warning_threshold {
            return;
        }
        let now = monotonic_ms();
        if now.saturating_sub(inner.last_warn_ms) >= WARN_INTERVAL_MS {
            inner.last_warn_ms = now;
            warn!(
                "queue[{}] backlog {} exceeds warning threshold {}",
                name,
                inner.items.len(),
                inner.warning_threshold
            );
        }
    }

    /// Enforce the limit for one incoming element. With a drop fn, the
    /// oldest `limit/2` elements are removed through it; without one,
    /// blocks until a consumer makes room (or the queue stops).
    fn make_room<'a>(&'a self, mut inner: MutexGuard<'a, Inner<T>>) -> MutexGuard<'a, Inner<T>> {
        if self.limit == 0 {
            return inner;
        }
        loop {
            if inner.stopped || inner.items.len() < self.limit {
                return inner;
            }
            let state = &mut *inner;
            if let Some(drop_fn) = state.drop_fn.as_ref() {
                let drop_n = (self.limit / 2).max(1);
                for _ in 0..drop_n {
                    match state.items.pop_front() {
                        Some(item) => drop_fn(item),
                        None => break,
                    }
                }
                return inner;
            }
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.make_room(self.lock());
        if inner.stopped {
            return;
        }
        inner.items.push_back(item);
        Self::warn_if_over_threshold(&self.name, &mut inner);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Enqueue a whole batch under one critical section.
    pub fn push_bulk(&self, items: impl IntoIterator<Item = T>) {
        let mut inner = self.lock();
        for item in items {
            inner = self.make_room(inner);
            if inner.stopped {
                return;
            }
            inner.items.push_back(item);
        }
        Self::warn_if_over_threshold(&self.name, &mut inner);
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Wait up to `wait_ms` for at least `min_n` items, then drain up to
    /// `max_n` into `out`. Existing contents of `out` are preserved.
    pub fn pop_front(
        &self,
        out: &mut Vec<T>,
        min_n: usize,
        max_n: usize,
        wait_ms: u64,
    ) -> PopStatus {
        let min_n = min_n.max(1);
        let deadline = monotonic_ms() + wait_ms;
        let mut inner = self.lock();

        let status = loop {
            if inner.items.len() >= min_n {
                break PopStatus::Ready;
            }
            if inner.stopped {
                break PopStatus::TimedOut;
            }
            let now = monotonic_ms();
            if now >= deadline {
                break PopStatus::TimedOut;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, Duration::from_millis(deadline - now))
                .unwrap_or_else(|p| p.into_inner().0);
            inner = guard;
        };

        let take = inner.items.len().min(max_n.max(min_n));
        inner.in_flight += take;
        out.extend(inner.items.drain(..take));
        drop(inner);
        if take > 0 {
            self.not_full.notify_all();
        }
        status
    }

    /// Acknowledge `n` previously popped items as fully processed.
    /// Consumers that participate in [`pending`](Self::pending)-based
    /// flushing must call this once their batch is done.
    pub fn ack(&self, n: usize) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(n);
    }

    /// Queued items plus popped-but-unacknowledged items.
    pub fn pending(&self) -> usize {
        let inner = self.lock();
        inner.items.len() + inner.in_flight
    }

    pub fn size(&self) -> usize {
        self.lock().items.len()
    }

    /// Idempotent. Wakes every producer and consumer; subsequent pops
    /// time out immediately and subsequent pushes are discarded.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }
}
