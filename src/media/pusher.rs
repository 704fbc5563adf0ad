// src/media/pusher.rs - Smoothed packet writer for the output muxer
//
// A bounded queue feeds one writer thread: every packet runs through
// the timestamp smoother (pts == dts, strictly increasing) before
// av_interleaved_write_frame. The queue is polled on a short timeout
// so shutdown stays responsive; close drains pending packets before
// the trailer is written.

use ffmpeg_next::packet::Mut;
use ffmpeg_next::Packet;
use ffmpeg_sys_next::{
    av_interleaved_write_frame, av_write_trailer, avcodec_parameters_copy,
    avformat_alloc_output_context2, avformat_new_stream, avformat_write_header, avio_open,
    AVCodecID, AVCodecParameters, AVFormatContext, AVIO_FLAG_WRITE, AV_NOPTS_VALUE,
};
use log::{debug, error, info, warn};
use std::ffi::CString;
use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{AvError, Error, MuxingError, Result};
use crate::media::context::{av_err2str, dict_from_pairs, ensure_ffmpeg_init, OutputFormatContext};
use crate::media::smoother::{SmootherParams, SmootherStats, TimestampSmoother};
use crate::queue::BlockingQueue;

const WRITER_POLL_MS: u64 = 10;
const QUEUE_LIMIT: usize = 256;

/// Container format forced for each recognized output scheme; plain
/// paths let the muxer guess from the file name.
pub(crate) fn output_format_name(
    url: &str,
    input_codec: AVCodecID,
) -> std::result::Result<Option<&'static str>, ()> {
    match url.split_once("://") {
        None => Ok(None),
        Some(("rtsp", _)) => Ok(Some("rtsp")),
        Some(("rtmp", _)) => Ok(Some("flv")),
        Some(("rtp", _)) => Ok(Some("rtp")),
        Some(("udp" | "tcp", _)) => Ok(Some(match input_codec {
            AVCodecID::AV_CODEC_ID_H264 => "h264",
            AVCodecID::AV_CODEC_ID_HEVC => "hevc",
            _ => "rawvideo",
        })),
        Some(_) => Err(()),
    }
}

pub struct PusherConfig {
    pub url: String,
    pub smoother: SmootherParams,
}

impl PusherConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            smoother: SmootherParams::default(),
        }
    }
}

/// Queue-fed muxer driver.
pub struct StreamPusher {
    queue: Arc<BlockingQueue<Packet>>,
    smoother: Arc<Mutex<TimestampSmoother>>,
    stop: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    url: String,
}

impl StreamPusher {
    /// Open `config.url` for writing, copying the codec parameters of
    /// the single output stream from `codecpar`, and start the writer
    /// thread. RTSP outputs force TCP transport and a small mux delay.
    pub fn open(config: PusherConfig, codecpar: *const AVCodecParameters) -> Result<Self> {
        ensure_ffmpeg_init();

        let input_codec = if codecpar.is_null() {
            AVCodecID::AV_CODEC_ID_NONE
        } else {
            unsafe { (*codecpar).codec_id }
        };
        let format_name = output_format_name(&config.url, input_codec)
            .map_err(|_| Error::Muxing(MuxingError::UnsupportedUrl(config.url.clone())))?;

        let url_c = CString::new(config.url.as_str())
            .map_err(|_| Error::Muxing(MuxingError::UnsupportedUrl(config.url.clone())))?;
        let format_c = format_name.map(|n| CString::new(n).unwrap_or_default());

        let mut out = unsafe {
            let mut fmt_ctx: *mut AVFormatContext = null_mut();
            let ret = avformat_alloc_output_context2(
                &mut fmt_ctx,
                null_mut(),
                format_c.as_ref().map_or(null(), |c| c.as_ptr()),
                url_c.as_ptr(),
            );
            if ret < 0 || fmt_ctx.is_null() {
                return Err(Error::Muxing(MuxingError::AllocOutput(AvError::new(ret))));
            }
            let out = OutputFormatContext::new(fmt_ctx);

            let stream = avformat_new_stream(fmt_ctx, null());
            if stream.is_null() {
                return Err(Error::Muxing(MuxingError::AllocOutput(AvError::new(-1))));
            }
            if !codecpar.is_null() {
                let ret = avcodec_parameters_copy((*stream).codecpar, codecpar);
                if ret < 0 {
                    return Err(Error::Muxing(MuxingError::AllocOutput(AvError::new(ret))));
                }
            }
            out
        };

        info!(
            "open output url={} format={}",
            config.url,
            format_name.unwrap_or("(by extension)")
        );
        Self::write_header(&mut out, &config.url, &url_c)?;

        let queue = Arc::new(BlockingQueue::new("pusher", QUEUE_LIMIT));
        let smoother = Arc::new(Mutex::new(TimestampSmoother::new(config.smoother)));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let queue = queue.clone();
            let smoother = smoother.clone();
            let stop = stop.clone();
            let url = config.url.clone();
            std::thread::Builder::new()
                .name("pusher".into())
                .spawn(move || writer_loop(out, queue, smoother, stop, url))
                .map_err(|_| Error::Muxing(MuxingError::AllocOutput(AvError::new(-1))))?
        };

        Ok(Self {
            queue,
            smoother,
            stop,
            writer: Some(writer),
            url: config.url,
        })
    }

    fn write_header(
        out: &mut OutputFormatContext,
        url: &str,
        url_c: &CString,
    ) -> Result<()> {
        unsafe {
            if out.needs_io_open() {
                let pb = &mut (*out.fmt_ctx).pb;
                let ret = avio_open(pb, url_c.as_ptr(), AVIO_FLAG_WRITE);
                if ret < 0 {
                    error!("cannot open output io for {url}: {}", av_err2str(ret));
                    return Err(Error::Muxing(MuxingError::OpenIo(AvError::new(ret))));
                }
                out.io_open = true;
            }

            let mut opts = if url.starts_with("rtsp://") {
                dict_from_pairs(&[("rtsp_transport", "tcp"), ("muxdelay", "0.1")])
            } else {
                null_mut()
            };
            let ret = avformat_write_header(out.fmt_ctx, &mut opts);
            ffmpeg_sys_next::av_dict_free(&mut opts);
            if ret < 0 {
                error!("write header failed for {url}: {}", av_err2str(ret));
                return Err(Error::Muxing(MuxingError::WriteHeader(AvError::new(ret))));
            }
        }
        Ok(())
    }

    /// Hand one encoded packet to the writer. Ownership moves; blocks
    /// briefly when the writer is behind.
    pub fn push(&self, packet: Packet) {
        self.queue.push(packet);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.size()
    }

    pub fn smoother_stats(&self) -> SmootherStats {
        self.smoother
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .stats()
    }

    /// Drain pending packets, write the trailer, join the writer.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!("pusher[{}] writer join failed", self.url);
            }
        }
        self.queue.stop();
    }
}

impl Drop for StreamPusher {
    fn drop(&mut self) {
        self.close();
    }
}

fn writer_loop(
    mut out: OutputFormatContext,
    queue: Arc<BlockingQueue<Packet>>,
    smoother: Arc<Mutex<TimestampSmoother>>,
    stop: Arc<AtomicBool>,
    url: String,
) {
    let mut batch: Vec<Packet> = Vec::new();
    loop {
        batch.clear();
        queue.pop_front(&mut batch, 1, 8, WRITER_POLL_MS);
        let taken = batch.len();

        for packet in batch.drain(..) {
            write_one(&mut out, &smoother, packet, &url);
        }
        if taken > 0 {
            queue.ack(taken);
        }

        if stop.load(Ordering::Acquire) && queue.size() == 0 {
            break;
        }
    }

    unsafe {
        let ret = av_write_trailer(out.fmt_ctx);
        if ret < 0 {
            warn!("write trailer failed for {url}: {}", av_err2str(ret));
        }
    }
    out.close_io();
    let stats = smoother.lock().unwrap_or_else(|p| p.into_inner()).stats();
    debug!(
        "pusher[{url}] exited: {} packets, {} corrected",
        stats.total_packets, stats.corrected_packets
    );
}

fn write_one(
    out: &mut OutputFormatContext,
    smoother: &Arc<Mutex<TimestampSmoother>>,
    mut packet: Packet,
    url: &str,
) {
    unsafe {
        let pkt = packet.as_mut_ptr();
        let input_pts = if (*pkt).pts == AV_NOPTS_VALUE {
            None
        } else {
            Some((*pkt).pts)
        };
        let output = smoother
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .process(input_pts);
        (*pkt).pts = output;
        (*pkt).dts = output;
        (*pkt).stream_index = 0;

        let ret = av_interleaved_write_frame(out.fmt_ctx, pkt);
        if ret != 0 {
            warn!("write frame failed for {url}: {}", av_err2str(ret));
        }
    }
}
