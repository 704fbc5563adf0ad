// src/timer.rs - Min-heap timer queue
//
// Core features:
// - O(log n) scheduling via a binary heap ordered by due time
// - O(1) deletion: entries are tombstoned and discarded at the heap top
// - Condition-variable waits sized to the earliest due time (no busy poll)
// - Callbacks run outside the queue lock; a panicking callback is logged
//   and dropped, never aborting the loop

use log::{debug, error};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::time::monotonic_ms;

/// Fire the timer forever until it is deleted.
pub const REPEAT_UNLIMITED: i32 = -1;
/// Fire the timer exactly once, at the initial skew.
pub const REPEAT_ONCE: i32 = 0;

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    id: u64,
    // Held only while the loop invokes the callback, outside the queue lock.
    callback: Mutex<TimerCallback>,
    valid: AtomicBool,
}

struct HeapItem {
    due_ms: u64,
    seq: u64,
    interval_ms: u64,
    // -1 unlimited; k > 0 fires remaining (including the next); 0 retired
    remaining: i32,
    entry: Arc<TimerEntry>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: invert so the earliest due time wins;
        // ties break by insertion order.
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<HeapItem>,
    index: HashMap<u64, Arc<TimerEntry>>,
}

/// Single-loop timer service driving periodic and one-shot callbacks.
///
/// `run_loop` blocks the calling thread until `stop`; exactly one loop
/// drives all firings. Creation and deletion are safe from any thread.
pub struct TimerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Schedule a timer. The first fire happens at `now + skew_ms`,
    /// subsequent fires every `delay_ms`. `repeat` is [`REPEAT_UNLIMITED`]
    /// for no limit, [`REPEAT_ONCE`] for a single fire, or `k > 0` for
    /// exactly `k` fires total. Returns the timer id (always >= 1).
    pub fn create_timer(
        &self,
        delay_ms: u64,
        skew_ms: u64,
        callback: impl FnMut() + Send + 'static,
        repeat: i32,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = Arc::new(TimerEntry {
            id,
            callback: Mutex::new(Box::new(callback)),
            valid: AtomicBool::new(true),
        });

        let remaining = if repeat < 0 { REPEAT_UNLIMITED } else { repeat.max(1) };
        {
            let mut state = self.lock_state();
            state.index.insert(id, entry.clone());
            state.heap.push(HeapItem {
                due_ms: monotonic_ms() + skew_ms,
                seq: id,
                interval_ms: delay_ms,
                remaining,
                entry,
            });
        }
        self.cond.notify_one();
        id
    }

    /// Remove a timer. Returns false when the id is unknown or already
    /// retired. The heap slot is reclaimed lazily when it reaches the top.
    pub fn delete_timer(&self, id: u64) -> bool {
        let mut state = self.lock_state();
        match state.index.remove(&id) {
            Some(entry) => {
                entry.valid.store(false, AtomicOrdering::Release);
                true
            }
            None => false,
        }
    }

    /// Number of live timers (tombstones excluded).
    pub fn count(&self) -> usize {
        self.lock_state().index.len()
    }

    /// Drive firings on the calling thread until [`stop`](Self::stop).
    pub fn run_loop(&self) {
        self.running.store(true, AtomicOrdering::Release);
        let mut state = self.lock_state();

        while self.running.load(AtomicOrdering::Acquire) {
            // Discard tombstones that surfaced at the top.
            while state
                .heap
                .peek()
                .is_some_and(|top| !top.entry.valid.load(AtomicOrdering::Acquire))
            {
                state.heap.pop();
            }

            let Some(top) = state.heap.peek() else {
                state = self
                    .cond
                    .wait(state)
                    .unwrap_or_else(|p| p.into_inner());
                continue;
            };

            let now = monotonic_ms();
            if top.due_ms > now {
                let wait = Duration::from_millis(top.due_ms - now);
                let (guard, _) = self
                    .cond
                    .wait_timeout(state, wait)
                    .unwrap_or_else(|p| p.into_inner().0);
                state = guard;
                // Re-evaluate: a new, earlier timer may have arrived.
                continue;
            }

            let mut item = match state.heap.pop() {
                Some(item) => item,
                None => continue,
            };
            let entry = item.entry.clone();
            if !entry.valid.load(AtomicOrdering::Acquire) {
                continue;
            }

            let reschedule = match item.remaining {
                REPEAT_UNLIMITED => true,
                n => {
                    item.remaining = n - 1;
                    item.remaining > 0
                }
            };
            if reschedule {
                item.due_ms = now + item.interval_ms;
                state.heap.push(item);
            } else {
                state.index.remove(&entry.id);
            }

            drop(state);
            let result = catch_unwind(AssertUnwindSafe(|| {
                let mut cb = entry
                    .callback
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                (*cb)();
            }));
            if result.is_err() {
                error!("timer {} callback panicked; continuing", entry.id);
            }
            state = self.lock_state();
        }

        // Free everything so no retired callback can fire again.
        state.heap.clear();
        state.index.clear();
        debug!("timer queue loop exited");
    }

    /// Idempotent; wakes the loop which then returns.
    pub fn stop(&self) {
        self.running.store(false, AtomicOrdering::Release);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn spawn_loop(queue: &Arc<TimerQueue>) -> thread::JoinHandle<()> {
        let q = queue.clone();
        thread::spawn(move || q.run_loop())
    }

    #[test]
    fn test_one_shot_fires_once() {
        let queue = Arc::new(TimerQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = spawn_loop(&queue);

        queue.create_timer(10, 10, move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }, REPEAT_ONCE);
        crate::time::sleep_ms(150);
        queue.stop();
        handle.join().unwrap();

        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_repeat_counts() {
        // repeat = k fires exactly k times in total.
        let queue = Arc::new(TimerQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = spawn_loop(&queue);

        queue.create_timer(20, 5, move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }, 3);
        crate::time::sleep_ms(300);
        queue.stop();
        handle.join().unwrap();

        assert_eq!(fired.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn test_unlimited_repeat_until_delete() {
        let queue = Arc::new(TimerQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = spawn_loop(&queue);

        let id = queue.create_timer(10, 5, move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }, REPEAT_UNLIMITED);
        crate::time::sleep_ms(120);
        assert!(queue.delete_timer(id));
        let at_delete = fired.load(AtomicOrdering::SeqCst);
        assert!(at_delete >= 3, "expected several fires, got {at_delete}");

        crate::time::sleep_ms(80);
        // No fire after deletion.
        let settled = fired.load(AtomicOrdering::SeqCst);
        crate::time::sleep_ms(50);
        assert_eq!(fired.load(AtomicOrdering::SeqCst), settled);

        queue.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_delete_unknown_id() {
        let queue = TimerQueue::new();
        assert!(!queue.delete_timer(12345));
    }

    #[test]
    fn test_deleted_before_fire_never_runs() {
        let queue = Arc::new(TimerQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = spawn_loop(&queue);

        let id = queue.create_timer(1000, 500, move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }, REPEAT_UNLIMITED);
        assert_eq!(queue.count(), 1);
        assert!(queue.delete_timer(id));
        assert_eq!(queue.count(), 0);

        crate::time::sleep_ms(50);
        queue.stop();
        handle.join().unwrap();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let queue = TimerQueue::new();
        let a = queue.create_timer(1000, 1000, || {}, REPEAT_ONCE);
        let b = queue.create_timer(1000, 1000, || {}, REPEAT_ONCE);
        assert!(a >= 1);
        assert!(b > a);
    }

    #[test]
    fn test_same_due_time_fires_in_creation_order() {
        let queue = Arc::new(TimerQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_loop(&queue);

        for tag in 0..4 {
            let order = order.clone();
            queue.create_timer(0, 50, move || {
                order.lock().unwrap().push(tag);
            }, REPEAT_ONCE);
        }
        crate::time::sleep_ms(200);
        queue.stop();
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_loop() {
        let queue = Arc::new(TimerQueue::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = spawn_loop(&queue);

        queue.create_timer(0, 10, || panic!("boom"), REPEAT_ONCE);
        queue.create_timer(0, 40, move || {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        }, REPEAT_ONCE);

        crate::time::sleep_ms(150);
        queue.stop();
        handle.join().unwrap();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_fire_times_track_skew() {
        // Scaled-down version of the precision scenario: a handful of
        // staggered one-shots, generous bound for loaded machines.
        let queue = Arc::new(TimerQueue::new());
        let fires = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_loop(&queue);

        let start = monotonic_ms();
        for k in 1..=5u64 {
            let fires = fires.clone();
            queue.create_timer(0, k * 40, move || {
                fires.lock().unwrap().push((k, monotonic_ms()));
            }, REPEAT_ONCE);
        }
        crate::time::sleep_ms(400);
        queue.stop();
        handle.join().unwrap();

        let fires = fires.lock().unwrap();
        assert_eq!(fires.len(), 5);
        for (k, at) in fires.iter() {
            let expected = start + k * 40;
            let err = at.abs_diff(expected);
            assert!(err <= 50, "timer {k}: fired {err} ms off target");
        }
    }
}
