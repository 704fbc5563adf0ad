// src/media/demuxer.rs - Input stream driver
//
// State machine: Initialize -> Service -> Down. One reader thread owns
// the AVFormatContext; packets are delivered to the registered observer
// and/or callbacks from that thread, and unreferenced afterwards (an
// event handler that retains a packet must take its own reference).

use ffmpeg_next::packet::{Mut, Ref};
use ffmpeg_next::Packet;
use ffmpeg_sys_next::{
    av_gettime, av_q2d, av_read_frame, av_rescale_q, av_seek_frame, av_usleep,
    avformat_find_stream_info, avformat_open_input, AVFormatContext, AVRational, AVERROR_EOF,
    AVSEEK_FLAG_BYTE, AV_NOPTS_VALUE, AV_TIME_BASE, AV_TIME_BASE_Q,
};
use log::{debug, error, info, warn};
use std::ffi::CString;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{AvError, DemuxingError, Error, OpenInputError, Result};
use crate::media::context::{dict_from_pairs, ensure_ffmpeg_init, InputFormatContext};
use crate::time::sleep_ms;

/// Pacing bound: packets ahead of wall clock by more than this are not
/// delayed (microseconds).
const MAX_PACING_DELAY_US: i64 = 100_000;

/// Observer surface; all methods are invoked on the reader thread.
#[allow(unused_variables)]
pub trait DemuxerEvents: Send {
    /// The input is open and stream info is available. The context
    /// pointer is valid for the duration of the call.
    fn on_format_opened(&mut self, fmt_ctx: *mut AVFormatContext) {}
    fn on_format_closed(&mut self) {}
    /// One demuxed packet. Ownership stays with the driver.
    fn on_packet(&mut self, packet: &mut Packet) {}
    fn on_eof(&mut self) {}
}

type FormatOpenedFn = Box<dyn FnMut(*mut AVFormatContext) + Send>;
type FormatClosedFn = Box<dyn FnMut() + Send>;
type PacketFn = Box<dyn FnMut(&mut Packet) + Send>;
type EofFn = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    on_format_opened: Option<FormatOpenedFn>,
    on_format_closed: Option<FormatClosedFn>,
    on_packet: Option<PacketFn>,
    on_eof: Option<EofFn>,
}

struct Shared {
    keep_running: AtomicBool,
    repeat: AtomicBool,
    observer: Mutex<Option<Arc<Mutex<dyn DemuxerEvents>>>>,
    callbacks: Mutex<Callbacks>,
}

impl Shared {
    fn fire_format_opened(&self, ctx: *mut AVFormatContext) {
        if let Some(observer) = self.observer.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_format_opened(ctx);
        }
        if let Some(cb) = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_format_opened
            .as_mut()
        {
            cb(ctx);
        }
    }

    fn fire_format_closed(&self) {
        if let Some(observer) = self.observer.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_format_closed();
        }
        if let Some(cb) = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_format_closed
            .as_mut()
        {
            cb();
        }
    }

    fn fire_packet(&self, packet: &mut Packet) {
        if let Some(observer) = self.observer.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_packet(packet);
        }
        if let Some(cb) = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_packet
            .as_mut()
        {
            cb(packet);
        }
    }

    fn fire_eof(&self) {
        if let Some(observer) = self.observer.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            observer.lock().unwrap_or_else(|p| p.into_inner()).on_eof();
        }
        if let Some(cb) = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_eof
            .as_mut()
        {
            cb();
        }
    }
}

/// URL categories the driver recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrlKind {
    Rtsp,
    Stream,
    File,
}

/// Per-scheme handling: `rtsp://` gets RTSP options, other known stream
/// schemes get defaults, plain paths are files, everything else is
/// rejected.
pub(crate) fn classify_url(url: &str) -> std::result::Result<UrlKind, ()> {
    match url.split_once("://") {
        None => Ok(UrlKind::File),
        Some(("rtsp", _)) => Ok(UrlKind::Rtsp),
        Some(("rtp" | "udp" | "tcp" | "rtmp", _)) => Ok(UrlKind::Stream),
        Some(("file", _)) => Ok(UrlKind::File),
        Some(_) => Err(()),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Initialize,
    Service,
    Down,
}

pub struct StreamDemuxer {
    id: i32,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl StreamDemuxer {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            shared: Arc::new(Shared {
                keep_running: AtomicBool::new(false),
                repeat: AtomicBool::new(false),
                observer: Mutex::new(None),
                callbacks: Mutex::new(Callbacks::default()),
            }),
            thread: None,
        }
    }

    pub fn set_observer(&self, observer: Arc<Mutex<dyn DemuxerEvents>>) {
        *self
            .shared
            .observer
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(observer);
    }

    pub fn set_format_opened_callback(&self, f: impl FnMut(*mut AVFormatContext) + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_format_opened = Some(Box::new(f));
    }

    pub fn set_format_closed_callback(&self, f: impl FnMut() + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_format_closed = Some(Box::new(f));
    }

    pub fn set_packet_callback(&self, f: impl FnMut(&mut Packet) + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_packet = Some(Box::new(f));
    }

    pub fn set_eof_callback(&self, f: impl FnMut() + Send + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_eof = Some(Box::new(f));
    }

    /// Launch the driver thread. With `sync_open`, the first Initialize
    /// runs on the caller so open errors surface directly.
    pub fn open_stream(
        &mut self,
        url: impl Into<String>,
        observer: Option<Arc<Mutex<dyn DemuxerEvents>>>,
        repeat: bool,
        sync_open: bool,
    ) -> Result<()> {
        self.close_stream(false);

        let url = url.into();
        let kind = classify_url(&url)
            .map_err(|_| Error::OpenInput(OpenInputError::UnsupportedScheme(url.clone())))?;

        if let Some(observer) = observer {
            self.set_observer(observer);
        }
        self.shared.repeat.store(repeat, Ordering::Release);
        self.shared.keep_running.store(true, Ordering::Release);

        let mut preopened = None;
        if sync_open {
            preopened = Some(do_initialize(&self.shared, &url, kind)?);
        }

        let shared = self.shared.clone();
        let id = self.id;
        let thread = std::thread::Builder::new()
            .name(format!("demuxer:{id}"))
            .spawn(move || driver_loop(shared, id, url, kind, preopened))
            .map_err(|_| Error::Demuxing(DemuxingError::ThreadSpawn))?;
        self.thread = Some(thread);
        Ok(())
    }

    /// With `wait == false` the driver is told to stop first; either way
    /// the reader thread is joined.
    pub fn close_stream(&mut self, wait: bool) {
        if !wait {
            self.shared.repeat.store(false, Ordering::Release);
            self.shared.keep_running.store(false, Ordering::Release);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("demuxer[{}] reader thread join failed", self.id);
            }
        }
    }
}

impl Drop for StreamDemuxer {
    fn drop(&mut self) {
        self.close_stream(false);
    }
}

fn do_initialize(shared: &Shared, url: &str, kind: UrlKind) -> Result<InputFormatContext> {
    ensure_ffmpeg_init();

    let mut pairs: Vec<(&str, &str)> = Vec::new();
    if kind == UrlKind::Rtsp {
        pairs.push(("rtsp_transport", "tcp"));
        pairs.push(("stimeout", "2000000"));
        pairs.push(("probesize", "400"));
        pairs.push(("analyzeduration", "100"));
    }
    pairs.push(("rw_timeout", "15000"));
    let mut opts = dict_from_pairs(&pairs);

    let url_c =
        CString::new(url).map_err(|_| Error::OpenInput(OpenInputError::UnsupportedScheme(url.to_string())))?;

    info!("open stream {url}");
    let mut fmt_ctx: *mut AVFormatContext = null_mut();
    unsafe {
        let ret = avformat_open_input(&mut fmt_ctx, url_c.as_ptr(), null_mut(), &mut opts);
        ffmpeg_sys_next::av_dict_free(&mut opts);
        if ret < 0 {
            warn!("cannot open {url}: {}", crate::media::context::av_err2str(ret));
            return Err(Error::OpenInput(OpenInputError::Av(AvError::new(ret))));
        }
        let ctx = InputFormatContext::new(fmt_ctx);

        let ret = avformat_find_stream_info(ctx.fmt_ctx, null_mut());
        if ret < 0 {
            warn!("no stream info in {url}");
            return Err(Error::OpenInput(OpenInputError::Av(AvError::new(ret))));
        }

        debug!("opened {url}: {} stream(s)", (*ctx.fmt_ctx).nb_streams);
        shared.fire_format_opened(ctx.fmt_ctx);
        Ok(ctx)
    }
}

enum ServiceEnd {
    Eof,
    Stopped,
}

/// Read packets until EOF or stop. Streams without PTS get one
/// synthesized from the stream frame rate; delivery is paced so scaled
/// PTS never runs more than 100 ms ahead of the wall clock.
fn do_service(shared: &Shared, fmt: &InputFormatContext, kind: UrlKind, id: i32) -> ServiceEnd {
    let mut packet = Packet::empty();
    let mut start_time = unsafe { av_gettime() };
    let mut last_frame_time: i64 = 0;
    let mut frame_index: i64 = 0;

    loop {
        if !shared.keep_running.load(Ordering::Acquire) {
            return ServiceEnd::Stopped;
        }

        unsafe {
            let ret = av_read_frame(fmt.fmt_ctx, packet.as_mut_ptr());
            if ret < 0 {
                if ret != AVERROR_EOF {
                    sleep_ms(10);
                    continue;
                }
                if shared.repeat.load(Ordering::Acquire) && kind == UrlKind::File {
                    let start = (*fmt.fmt_ctx).start_time;
                    let mut sret = av_seek_frame(fmt.fmt_ctx, -1, start, 0);
                    if sret != 0 {
                        sret = av_seek_frame(fmt.fmt_ctx, -1, start, AVSEEK_FLAG_BYTE);
                        if sret < 0 {
                            warn!("demuxer[{id}] seek to start failed");
                        }
                    }
                    frame_index = 0;
                    start_time = av_gettime();
                    debug!("demuxer[{id}] looped back to start");
                    continue;
                }
                info!("demuxer[{id}] input reached end");
                shared.fire_eof();
                return ServiceEnd::Eof;
            }

            if (*fmt.fmt_ctx).nb_streams > 0 {
                let stream = *(*fmt.fmt_ctx).streams;
                let time_base: AVRational = (*stream).time_base;

                if last_frame_time != 0 {
                    if (*packet.as_ptr()).pts == AV_NOPTS_VALUE {
                        let frame_rate = av_q2d((*stream).r_frame_rate);
                        if frame_rate > 0.0 {
                            let calc_duration = AV_TIME_BASE as f64 / frame_rate;
                            let scale = av_q2d(time_base) * AV_TIME_BASE as f64;
                            let pkt = packet.as_mut_ptr();
                            (*pkt).pts = (frame_index as f64 * calc_duration / scale) as i64;
                            (*pkt).dts = (*pkt).pts;
                            (*pkt).duration = (calc_duration / scale) as i64;
                        }
                    }

                    let dts = (*packet.as_ptr()).dts;
                    if dts != AV_NOPTS_VALUE {
                        let pts_time = av_rescale_q(dts, time_base, AV_TIME_BASE_Q);
                        let now = av_gettime() - start_time;
                        let delta = pts_time - now;
                        if delta > 0 && delta < MAX_PACING_DELAY_US {
                            av_usleep(delta as u32);
                        }
                    }
                }

                last_frame_time = av_gettime();
                if (*packet.as_ptr()).stream_index == 0 {
                    frame_index += 1;
                }
            }
        }

        shared.fire_packet(&mut packet);
        unsafe {
            ffmpeg_sys_next::av_packet_unref(packet.as_mut_ptr());
        }
    }
}

fn driver_loop(
    shared: Arc<Shared>,
    id: i32,
    url: String,
    kind: UrlKind,
    preopened: Option<InputFormatContext>,
) {
    let mut state = if preopened.is_some() {
        State::Service
    } else {
        State::Initialize
    };
    let mut fmt = preopened;

    while shared.keep_running.load(Ordering::Acquire) {
        match state {
            State::Initialize => match do_initialize(&shared, &url, kind) {
                Ok(ctx) => {
                    fmt = Some(ctx);
                    state = State::Service;
                }
                Err(_) => {
                    // Reconnect cadence for flaky sources.
                    sleep_ms(1000);
                }
            },
            State::Service => {
                state = match fmt.as_ref() {
                    Some(ctx) => match do_service(&shared, ctx, kind, id) {
                        ServiceEnd::Eof | ServiceEnd::Stopped => State::Down,
                    },
                    None => State::Initialize,
                };
            }
            State::Down => {
                fmt = None; // closes the input
                shared.fire_format_closed();
                if shared.repeat.load(Ordering::Acquire)
                    && shared.keep_running.load(Ordering::Acquire)
                {
                    state = State::Initialize;
                } else {
                    break;
                }
            }
        }
    }

    // A stop during Service still closes the context and notifies.
    if fmt.take().is_some() {
        shared.fire_format_closed();
    }
    debug!("demuxer[{id}] thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_classification() {
        assert_eq!(classify_url("rtsp://cam/stream"), Ok(UrlKind::Rtsp));
        assert_eq!(classify_url("rtmp://host/app"), Ok(UrlKind::Stream));
        assert_eq!(classify_url("udp://0.0.0.0:5000"), Ok(UrlKind::Stream));
        assert_eq!(classify_url("tcp://1.2.3.4:9"), Ok(UrlKind::Stream));
        assert_eq!(classify_url("rtp://1.2.3.4:9"), Ok(UrlKind::Stream));
        assert_eq!(classify_url("/data/video.mp4"), Ok(UrlKind::File));
        assert_eq!(classify_url("relative.mkv"), Ok(UrlKind::File));
        assert_eq!(classify_url("file:///data/a.mp4"), Ok(UrlKind::File));
        assert!(classify_url("gopher://nope").is_err());
        assert!(classify_url("http://nope/also").is_err());
    }

    #[test]
    fn test_open_rejects_unknown_scheme() {
        let mut demuxer = StreamDemuxer::new(0);
        let err = demuxer
            .open_stream("ftp://server/file.ts", None, false, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OpenInput(OpenInputError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_open_missing_file_sync_surfaces_error() {
        let mut demuxer = StreamDemuxer::new(1);
        let result = demuxer.open_stream("/nonexistent/otl-test.mp4", None, false, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let mut demuxer = StreamDemuxer::new(2);
        demuxer.close_stream(false);
        demuxer.close_stream(true);
    }
}
