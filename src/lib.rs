//! otl - building blocks for real-time video analytics pipelines.
//!
//! The toolkit layers a media dataplane over an FFmpeg-compatible
//! library: a demuxer driver feeds a decoder (with application-SEI
//! extraction), decoded frames flow through a three-stage inference
//! pipeline built on bulk blocking queues and worker pools, and encoded
//! output reaches the muxer through a timestamp smoother that repairs
//! DTS/PTS anomalies. A min-heap timer service schedules periodic
//! diagnostics, and an async logger fans records out to console, file
//! and a line-oriented admin console.
//!
//! # Example
//!
//! ```rust,ignore
//! use otl::pipeline::{InferencePipeline, PipelineConfig, PipelineDelegate};
//! use otl::timer::TimerQueue;
//!
//! otl::logging::init(otl::logging::LogConfig::default());
//!
//! let pipeline = InferencePipeline::new(PipelineConfig::default(), delegate);
//! let timers = std::sync::Arc::new(TimerQueue::new());
//! let t = timers.clone();
//! std::thread::spawn(move || t.run_loop());
//! timers.create_timer(1000, 1000, move || {
//!     let status = pipeline.status();
//!     log::info!("pre fps {:.1}", status.preprocess.fps);
//! }, otl::timer::REPEAT_UNLIMITED);
//! ```

pub mod byte_buffer;
pub mod codec;
pub mod error;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod stat;
pub mod time;
pub mod timer;
pub mod worker;

pub use error::{Error, Result};
