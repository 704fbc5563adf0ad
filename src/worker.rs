// src/worker.rs - Batch worker pool over a blocking queue
//
// N stateless workers pull batches from one queue and hand them to a
// shared handler. Shutdown is cooperative: dropping the pool stops the
// queue, the workers observe the timeout and exit, the drop joins them.

use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::queue::{BlockingQueue, PopStatus};
use crate::time::sleep_ms;

const DEFAULT_WAIT_MS: u64 = 100;

pub type BatchHandler<T> = Arc<dyn Fn(&mut Vec<T>) + Send + Sync>;
pub type InitHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct WorkerConfig {
    pub thread_num: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub wait_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_num: 1,
            min_batch: 1,
            max_batch: 8,
            wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

pub struct WorkerPool<T: Send + 'static> {
    name: String,
    queue: Arc<BlockingQueue<T>>,
    threads: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `config.thread_num` workers pulling from `queue`. Each
    /// worker runs `init` (if any) once before its first pop. Handler
    /// panics are logged and the batch dropped; the worker keeps going.
    pub fn start(
        name: impl Into<String>,
        queue: Arc<BlockingQueue<T>>,
        config: WorkerConfig,
        handler: BatchHandler<T>,
        init: Option<InitHook>,
    ) -> Self {
        let name = name.into();
        let mut threads = Vec::with_capacity(config.thread_num);

        for worker_idx in 0..config.thread_num.max(1) {
            let queue = queue.clone();
            let handler = handler.clone();
            let init = init.clone();
            let config = config.clone();
            let pool_name = name.clone();

            let builder =
                std::thread::Builder::new().name(format!("worker:{pool_name}:{worker_idx}"));
            let handle = builder
                .spawn(move || {
                    if let Some(init) = init {
                        if catch_unwind(AssertUnwindSafe(|| init())).is_err() {
                            error!("worker[{pool_name}:{worker_idx}] init hook panicked");
                        }
                    }

                    let mut batch: Vec<T> = Vec::with_capacity(config.max_batch);
                    loop {
                        batch.clear();
                        let status = queue.pop_front(
                            &mut batch,
                            config.min_batch,
                            config.max_batch,
                            config.wait_ms,
                        );

                        if !batch.is_empty() {
                            let taken = batch.len();
                            let result =
                                catch_unwind(AssertUnwindSafe(|| handler(&mut batch)));
                            queue.ack(taken);
                            if result.is_err() {
                                error!(
                                    "worker[{pool_name}:{worker_idx}] handler panicked, batch dropped"
                                );
                                batch.clear();
                            }
                        }

                        if status == PopStatus::TimedOut && queue.is_stopped() {
                            break;
                        }
                    }
                    debug!("worker[{pool_name}:{worker_idx}] exited");
                })
                .unwrap_or_else(|e| {
                    // Pool continues under-provisioned; placeholder keeps join uniform.
                    error!("worker[{name}:{worker_idx}] spawn failed: {e}");
                    std::thread::spawn(|| {})
                });
            threads.push(handle);
        }

        Self {
            name,
            queue,
            threads,
        }
    }

    /// Block until the queue is drained and no handler is mid-batch.
    pub fn flush(&self) {
        while self.queue.pending() > 0 {
            sleep_ms(1);
        }
    }

    pub fn queue(&self) -> &Arc<BlockingQueue<T>> {
        &self.queue
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.queue.stop();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("worker pool[{}] thread join failed", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_all_items_processed() {
        let queue = Arc::new(BlockingQueue::new("wp-basic", 0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let pool = WorkerPool::start(
            "basic",
            queue.clone(),
            WorkerConfig {
                thread_num: 2,
                min_batch: 1,
                max_batch: 4,
                wait_ms: 20,
            },
            Arc::new(move |batch: &mut Vec<i32>| {
                seen2.lock().unwrap().extend(batch.drain(..));
            }),
            None,
        );

        for i in 0..50 {
            queue.push(i);
        }
        pool.flush();
        drop(pool);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_init_hook_runs_once_per_worker() {
        let queue: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new("wp-init", 0));
        let inits = Arc::new(AtomicUsize::new(0));
        let inits2 = inits.clone();
        let pool = WorkerPool::start(
            "init",
            queue.clone(),
            WorkerConfig {
                thread_num: 3,
                ..WorkerConfig::default()
            },
            Arc::new(|_batch: &mut Vec<i32>| {}),
            Some(Arc::new(move || {
                inits2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        sleep_ms(50);
        drop(pool);
        assert_eq!(inits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_handler_panic_does_not_kill_worker() {
        let queue = Arc::new(BlockingQueue::new("wp-panic", 0));
        let processed = Arc::new(AtomicUsize::new(0));
        let processed2 = processed.clone();
        let pool = WorkerPool::start(
            "panic",
            queue.clone(),
            WorkerConfig {
                thread_num: 1,
                min_batch: 1,
                max_batch: 1,
                wait_ms: 20,
            },
            Arc::new(move |batch: &mut Vec<i32>| {
                if batch[0] < 0 {
                    panic!("bad item");
                }
                processed2.fetch_add(batch.len(), Ordering::SeqCst);
            }),
            None,
        );

        queue.push(-1);
        queue.push(1);
        queue.push(2);
        pool.flush();
        drop(pool);
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_joins_workers() {
        let queue: Arc<BlockingQueue<i32>> = Arc::new(BlockingQueue::new("wp-drop", 0));
        let pool = WorkerPool::start(
            "drop",
            queue.clone(),
            WorkerConfig::default(),
            Arc::new(|_batch: &mut Vec<i32>| {}),
            None,
        );
        drop(pool);
        assert!(queue.is_stopped());
    }

    #[test]
    fn test_batch_sizes_respect_max() {
        let queue = Arc::new(BlockingQueue::new("wp-batch", 0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let max_seen2 = max_seen.clone();
        let pool = WorkerPool::start(
            "batch",
            queue.clone(),
            WorkerConfig {
                thread_num: 1,
                min_batch: 1,
                max_batch: 4,
                wait_ms: 20,
            },
            Arc::new(move |batch: &mut Vec<i32>| {
                max_seen2.fetch_max(batch.len(), Ordering::SeqCst);
            }),
            None,
        );
        queue.push_bulk(0..32);
        pool.flush();
        drop(pool);
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
        assert!(max_seen.load(Ordering::SeqCst) >= 1);
    }
}
