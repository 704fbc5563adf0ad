//! FFmpeg-backed stream drivers: demuxing, decoding (with SEI
//! extraction and optional hardware download / filter graph), encoding
//! with hardware-preference probing, and the smoothed output pusher.
//!
//! Threading: each driver owns exactly one I/O thread. Packet and frame
//! ownership moves at every callback or queue boundary; an event
//! handler that keeps data past the call must take its own reference.

pub mod context;
pub mod decoder;
pub mod demuxer;
mod filter;
pub mod encoder;
pub mod pusher;
pub mod smoother;

pub use context::av_err2str;
pub use decoder::{DecoderEvents, DecoderOptions, StreamDecoder};
pub use demuxer::{DemuxerEvents, StreamDemuxer};
pub use encoder::{EncodeParam, StreamEncoder};
pub use pusher::{PusherConfig, StreamPusher};
pub use smoother::{SmootherParams, SmootherStats, TimestampSmoother};
