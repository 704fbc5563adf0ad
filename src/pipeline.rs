// src/pipeline.rs - Three-stage inference pipeline
//
// preprocess -> forward -> postprocess, each stage a blocking queue plus
// worker pool plus throughput meter. Stage handlers come from a caller
// delegate; internal glue forwards each finished batch to the next
// stage's queue. The forward stage pops fixed batches of `batch_num`;
// the outer stages pop 1..=8.

use std::sync::{Arc, Mutex};

use crate::queue::BlockingQueue;
use crate::stat::RateMeter;
use crate::worker::{InitHook, WorkerConfig, WorkerPool};

/// Stage handler: receives the batch by reference, mutates in place.
pub type StageFn<T> = Arc<dyn Fn(&mut Vec<T>) + Send + Sync>;
/// Per-item completion callback, invoked after postprocess.
pub type FinishFn<T> = Arc<dyn Fn(&mut T) + Send + Sync>;

/// The caller-supplied record of stage functions.
///
/// Replaces an inheritance-style detector delegate: `initialize` runs
/// once on the forward worker before its first batch, the three stage
/// functions transform batches in place, and `on_finish` (if set) sees
/// every item leaving the pipeline.
pub struct PipelineDelegate<T> {
    pub initialize: Option<InitHook>,
    pub preprocess: StageFn<T>,
    pub forward: StageFn<T>,
    pub postprocess: StageFn<T>,
    pub on_finish: Option<FinishFn<T>>,
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub preprocess_queue_size: usize,
    pub preprocess_thread_num: usize,
    pub inference_queue_size: usize,
    pub inference_thread_num: usize,
    pub postprocess_queue_size: usize,
    pub postprocess_thread_num: usize,
    pub batch_num: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprocess_queue_size: 5,
            preprocess_thread_num: 4,
            inference_queue_size: 5,
            inference_thread_num: 1,
            postprocess_queue_size: 5,
            postprocess_thread_num: 2,
            batch_num: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageStatus {
    pub queue_capacity: usize,
    pub queue_current: usize,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineStatus {
    pub preprocess: StageStatus,
    pub forward: StageStatus,
    pub postprocess: StageStatus,
}

struct Stage<T: Send + 'static> {
    queue: Arc<BlockingQueue<T>>,
    meter: Arc<Mutex<RateMeter>>,
    pool: WorkerPool<T>,
    capacity: usize,
}

impl<T: Send + 'static> Stage<T> {
    fn status(&self) -> StageStatus {
        StageStatus {
            queue_capacity: self.capacity,
            queue_current: self.queue.size(),
            fps: self.meter.lock().unwrap_or_else(|p| p.into_inner()).speed(),
        }
    }
}

pub struct InferencePipeline<T: Send + 'static> {
    preprocess: Stage<T>,
    forward: Stage<T>,
    postprocess: Stage<T>,
}

impl<T: Send + 'static> InferencePipeline<T> {
    pub fn new(config: PipelineConfig, delegate: PipelineDelegate<T>) -> Self {
        let pre_queue = Arc::new(BlockingQueue::new(
            "preprocess",
            config.preprocess_queue_size,
        ));
        let fwd_queue = Arc::new(BlockingQueue::new(
            "inference",
            config.inference_queue_size,
        ));
        let post_queue = Arc::new(BlockingQueue::new(
            "postprocess",
            config.postprocess_queue_size,
        ));

        let pre_meter = Arc::new(Mutex::new(RateMeter::default()));
        let fwd_meter = Arc::new(Mutex::new(RateMeter::default()));
        let post_meter = Arc::new(Mutex::new(RateMeter::default()));

        let batch_num = config.batch_num.max(1);

        let pre_pool = {
            let handler = delegate.preprocess.clone();
            let meter = pre_meter.clone();
            let next = fwd_queue.clone();
            WorkerPool::start(
                "preprocess",
                pre_queue.clone(),
                WorkerConfig {
                    thread_num: config.preprocess_thread_num,
                    min_batch: 1,
                    max_batch: 8,
                    ..WorkerConfig::default()
                },
                Arc::new(move |items: &mut Vec<T>| {
                    handler(items);
                    meter.lock().unwrap_or_else(|p| p.into_inner()).update(items.len() as u64);
                    next.push_bulk(items.drain(..));
                }),
                None,
            )
        };

        let fwd_pool = {
            let handler = delegate.forward.clone();
            let meter = fwd_meter.clone();
            let next = post_queue.clone();
            WorkerPool::start(
                "forward",
                fwd_queue.clone(),
                WorkerConfig {
                    thread_num: config.inference_thread_num,
                    min_batch: batch_num,
                    max_batch: batch_num,
                    ..WorkerConfig::default()
                },
                Arc::new(move |items: &mut Vec<T>| {
                    handler(items);
                    meter.lock().unwrap_or_else(|p| p.into_inner()).update(items.len() as u64);
                    next.push_bulk(items.drain(..));
                }),
                delegate.initialize.clone(),
            )
        };

        let post_pool = {
            let handler = delegate.postprocess.clone();
            let finish = delegate.on_finish.clone();
            let meter = post_meter.clone();
            WorkerPool::start(
                "postprocess",
                post_queue.clone(),
                WorkerConfig {
                    thread_num: config.postprocess_thread_num,
                    min_batch: 1,
                    max_batch: 8,
                    ..WorkerConfig::default()
                },
                Arc::new(move |items: &mut Vec<T>| {
                    handler(items);
                    meter.lock().unwrap_or_else(|p| p.into_inner()).update(items.len() as u64);
                    if let Some(finish) = &finish {
                        for item in items.iter_mut() {
                            finish(item);
                        }
                    }
                }),
                None,
            )
        };

        Self {
            preprocess: Stage {
                queue: pre_queue,
                meter: pre_meter,
                pool: pre_pool,
                capacity: config.preprocess_queue_size,
            },
            forward: Stage {
                queue: fwd_queue,
                meter: fwd_meter,
                pool: fwd_pool,
                capacity: config.inference_queue_size,
            },
            postprocess: Stage {
                queue: post_queue,
                meter: post_meter,
                pool: post_pool,
                capacity: config.postprocess_queue_size,
            },
        }
    }

    /// Enqueue a frame at the head of the pipeline; blocks when the
    /// preprocess queue is at capacity.
    pub fn push_frame(&self, frame: T) {
        self.preprocess.queue.push(frame);
    }

    /// Wait for every stage to drain, head to tail.
    pub fn flush(&self) {
        self.preprocess.pool.flush();
        self.forward.pool.flush();
        self.postprocess.pool.flush();
    }

    /// Per-stage `(capacity, current, fps)` snapshot.
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            preprocess: self.preprocess.status(),
            forward: self.forward.status(),
            postprocess: self.postprocess.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn passthrough<T: Send + 'static>() -> StageFn<T> {
        Arc::new(|_items: &mut Vec<T>| {})
    }

    #[test]
    fn test_smoke_all_frames_reach_postprocess() {
        let finished = Arc::new(AtomicUsize::new(0));
        let post_count = finished.clone();
        let pipeline = InferencePipeline::new(
            PipelineConfig {
                batch_num: 4,
                preprocess_queue_size: 5,
                inference_queue_size: 5,
                postprocess_queue_size: 5,
                ..PipelineConfig::default()
            },
            PipelineDelegate {
                initialize: None,
                preprocess: passthrough(),
                forward: passthrough(),
                postprocess: Arc::new(move |items: &mut Vec<u32>| {
                    post_count.fetch_add(items.len(), Ordering::SeqCst);
                }),
                on_finish: None,
            },
        );

        for i in 0..20u32 {
            pipeline.push_frame(i);
        }
        pipeline.flush();
        assert_eq!(finished.load(Ordering::SeqCst), 20);

        let status = pipeline.status();
        assert_eq!(status.preprocess.queue_capacity, 5);
        assert_eq!(status.postprocess.queue_current, 0);
    }

    #[test]
    fn test_stage_order_preserved_single_threaded() {
        // One thread per stage keeps the per-stage FIFO observable.
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        let pipeline = InferencePipeline::new(
            PipelineConfig {
                preprocess_thread_num: 1,
                inference_thread_num: 1,
                postprocess_thread_num: 1,
                batch_num: 1,
                ..PipelineConfig::default()
            },
            PipelineDelegate {
                initialize: None,
                preprocess: Arc::new(|items: &mut Vec<u32>| {
                    for v in items.iter_mut() {
                        *v *= 10;
                    }
                }),
                forward: passthrough(),
                postprocess: passthrough(),
                on_finish: Some(Arc::new(move |item: &mut u32| {
                    order2.lock().unwrap().push(*item);
                })),
            },
        );

        for i in 0..10u32 {
            pipeline.push_frame(i);
        }
        pipeline.flush();
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..10).map(|v| v * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_initialize_runs_on_forward_worker() {
        let inited = Arc::new(AtomicUsize::new(0));
        let inited2 = inited.clone();
        let pipeline = InferencePipeline::new(
            PipelineConfig {
                inference_thread_num: 1,
                ..PipelineConfig::default()
            },
            PipelineDelegate::<u32> {
                initialize: Some(Arc::new(move || {
                    inited2.fetch_add(1, Ordering::SeqCst);
                })),
                preprocess: passthrough(),
                forward: passthrough(),
                postprocess: passthrough(),
                on_finish: None,
            },
        );
        pipeline.push_frame(1);
        pipeline.flush();
        assert_eq!(inited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forward_sees_exact_batches() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sizes2 = sizes.clone();
        let pipeline = InferencePipeline::new(
            PipelineConfig {
                batch_num: 4,
                inference_thread_num: 1,
                ..PipelineConfig::default()
            },
            PipelineDelegate {
                initialize: None,
                preprocess: passthrough(),
                forward: Arc::new(move |items: &mut Vec<u32>| {
                    sizes2.lock().unwrap().push(items.len());
                }),
                postprocess: passthrough(),
                on_finish: None,
            },
        );
        for i in 0..16u32 {
            pipeline.push_frame(i);
        }
        pipeline.flush();
        let sizes = sizes.lock().unwrap();
        assert!(sizes.iter().all(|n| *n == 4), "batches {sizes:?}");
    }
}
