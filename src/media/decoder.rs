// src/media/decoder.rs - Decoding driver observing the demuxer
//
// Owns the codec context (or borrows an external one). Packets are
// gated on the first keyframe, probed for application SEI, retained in
// FIFO order, and paired with decoded frames on dispatch. Hardware
// surfaces can be downloaded to system memory; a user filter string
// ("filter"/"vf" option keys) builds a lazy filter graph from the
// first real frame.

use bytes::Bytes;
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::packet::{Mut, Ref};
use ffmpeg_next::Packet;
use ffmpeg_sys_next::{
    av_buffer_ref, av_buffer_unref, av_frame_copy_props, av_hwdevice_ctx_create,
    av_hwdevice_find_type_by_name, av_hwframe_transfer_data, avcodec_alloc_context3,
    avcodec_find_decoder, avcodec_free_context, avcodec_get_hw_config, avcodec_open2,
    avcodec_parameters_to_context, avcodec_receive_frame, avcodec_send_packet, AVBufferRef,
    AVCodec, AVCodecContext, AVCodecID, AVFormatContext, AVHWDeviceType, AVMediaType,
    AVPixelFormat, AVRational, AVERROR, AVERROR_EOF, AV_PKT_FLAG_KEY, EAGAIN,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::ffi::CString;
use std::ptr::null_mut;
use std::sync::{Arc, Mutex};

use crate::codec::keyframe::{is_keyframe, VideoCodec};
use crate::codec::sei::read_sei;
use crate::error::{AvError, DecodingError, Error, Result};
use crate::media::context::{av_err2str, dict_from_pairs};
use crate::media::demuxer::{DemuxerEvents, StreamDemuxer};
use crate::media::filter::FrameFilter;

// AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX
const HW_METHOD_DEVICE_CTX: i32 = 0x01;

/// Observer surface; invoked on the demuxer's reader thread.
#[allow(unused_variables)]
pub trait DecoderEvents: Send {
    /// A decoded frame paired with the oldest retained packet.
    /// Both borrows end with the call; take references to retain.
    fn on_decoded_frame(&mut self, packet: &Packet, frame: &VideoFrame);
    /// Application SEI payload found in an input packet.
    fn on_sei(&mut self, payload: Bytes, pts: i64, pos: i64) {}
    fn on_stream_eof(&mut self) {}
}

#[derive(Clone, Default)]
pub struct DecoderOptions {
    pub prefer_hardware: bool,
    /// Explicit hardware backend ("cuda", "vaapi", "qsv",
    /// "videotoolbox"); empty means platform default order.
    pub hw_accel: Option<String>,
    /// Copy hardware surfaces into system memory before dispatch.
    pub download_hw_frames: bool,
    /// Raw key/value options; "filter" / "vf" select a filter graph,
    /// everything else goes to the decoder untouched.
    pub options: Vec<(String, String)>,
}

impl DecoderOptions {
    pub(crate) fn filter_desc(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == "filter" || k == "vf")
            .map(|(_, v)| v.as_str())
    }

    fn decoder_pairs(&self) -> Vec<(&str, &str)> {
        self.options
            .iter()
            .filter(|(k, _)| k != "filter" && k != "vf")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

struct HwFormat {
    pix_fmt: AVPixelFormat,
}

unsafe extern "C" fn get_hw_format(
    ctx: *mut AVCodecContext,
    formats: *const AVPixelFormat,
) -> AVPixelFormat {
    let desired = (*ctx).opaque as *const HwFormat;
    let mut p = formats;
    while *p != AVPixelFormat::AV_PIX_FMT_NONE {
        if !desired.is_null() && *p == (*desired).pix_fmt {
            return *p;
        }
        p = p.add(1);
    }
    // Preferred surface format unavailable; take the first offer.
    *formats
}

type DecodedFrameFn = Box<dyn FnMut(&Packet, &VideoFrame) + Send>;
type SeiFn = Box<dyn FnMut(Bytes, i64, i64) + Send>;
type EofFn = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    on_decoded_frame: Option<DecodedFrameFn>,
    on_sei: Option<SeiFn>,
    on_eof: Option<EofFn>,
}

struct DecoderCore {
    id: i32,
    options: DecoderOptions,
    dec_ctx: *mut AVCodecContext,
    external_ctx: *mut AVCodecContext,
    hw_device_ctx: *mut AVBufferRef,
    hw_format: Option<Box<HwFormat>>,
    video_stream_index: i32,
    codec: VideoCodec,
    codec_id: AVCodecID,
    time_base: AVRational,
    waiting_keyframe: bool,
    retained: VecDeque<Packet>,
    frames_decoded: u64,
    filter: Option<FrameFilter>,
    callbacks: Callbacks,
    observer: Option<Arc<Mutex<dyn DecoderEvents>>>,
}

// SAFETY: all raw pointers are owned by this core and only dereferenced
// by the demuxer reader thread, which holds the core's mutex for the
// duration of every event.
unsafe impl Send for DecoderCore {}

impl DecoderCore {
    fn new(id: i32, external_ctx: *mut AVCodecContext) -> Self {
        Self {
            id,
            options: DecoderOptions::default(),
            dec_ctx: null_mut(),
            external_ctx,
            hw_device_ctx: null_mut(),
            hw_format: None,
            video_stream_index: 0,
            codec: VideoCodec::Other,
            codec_id: AVCodecID::AV_CODEC_ID_NONE,
            time_base: AVRational { num: 1, den: 90_000 },
            waiting_keyframe: true,
            retained: VecDeque::new(),
            frames_decoded: 0,
            filter: None,
            callbacks: Callbacks::default(),
            observer: None,
        }
    }

    fn active_ctx(&self) -> *mut AVCodecContext {
        if self.external_ctx.is_null() {
            self.dec_ctx
        } else {
            self.external_ctx
        }
    }

    fn handle_format_opened(&mut self, ifmt_ctx: *mut AVFormatContext) {
        self.waiting_keyframe = true;
        if self.external_ctx.is_null() {
            if let Err(e) = self.create_video_decoder(ifmt_ctx) {
                error!("decoder[{}] create failed: {e}", self.id);
            }
        } else {
            unsafe {
                self.codec_id = (*self.external_ctx).codec_id;
                self.codec = codec_family(self.codec_id);
            }
        }
    }

    fn create_video_decoder(&mut self, ifmt_ctx: *mut AVFormatContext) -> Result<()> {
        unsafe {
            let mut video_index = None;
            for i in 0..(*ifmt_ctx).nb_streams {
                let stream = *(*ifmt_ctx).streams.add(i as usize);
                if (*(*stream).codecpar).codec_type == AVMediaType::AVMEDIA_TYPE_VIDEO {
                    video_index = Some(i as i32);
                    break;
                }
            }
            let video_index = video_index.ok_or(Error::Decoding(DecodingError::NoVideoStream))?;
            self.video_stream_index = video_index;

            let stream = *(*ifmt_ctx).streams.add(video_index as usize);
            let codecpar = (*stream).codecpar;
            self.time_base = (*stream).time_base;
            self.codec_id = (*codecpar).codec_id;
            self.codec = codec_family(self.codec_id);

            let codec = avcodec_find_decoder(self.codec_id);
            if codec.is_null() {
                return Err(Error::Decoding(DecodingError::DecoderNotFound(
                    self.codec_id as i32,
                )));
            }

            let ctx = avcodec_alloc_context3(codec);
            if ctx.is_null() {
                return Err(Error::Decoding(DecodingError::DecoderNotFound(
                    self.codec_id as i32,
                )));
            }

            let ret = avcodec_parameters_to_context(ctx, codecpar);
            if ret < 0 {
                let mut ctx = ctx;
                avcodec_free_context(&mut ctx);
                return Err(Error::Decoding(DecodingError::Open(AvError::new(ret))));
            }

            if self.options.prefer_hardware {
                self.try_init_hw(ctx, codec);
            }

            let mut opts = dict_from_pairs(&self.options.decoder_pairs());
            let ret = avcodec_open2(ctx, codec, &mut opts);
            ffmpeg_sys_next::av_dict_free(&mut opts);
            if ret < 0 {
                let mut ctx = ctx;
                avcodec_free_context(&mut ctx);
                return Err(Error::Decoding(DecodingError::Open(AvError::new(ret))));
            }

            self.dec_ctx = ctx;
            info!(
                "decoder[{}] opened, codec_id={:?}, hw={}",
                self.id,
                self.codec_id,
                !self.hw_device_ctx.is_null()
            );
            Ok(())
        }
    }

    /// Probe order: explicit backend, then the codec's own hardware
    /// config list, then plain software (no device context at all).
    unsafe fn try_init_hw(&mut self, ctx: *mut AVCodecContext, codec: *const AVCodec) {
        let explicit = self.options.hw_accel.as_deref().map(normalize_hw_name);

        let mut chosen: Option<(AVHWDeviceType, AVPixelFormat)> = None;
        let mut i = 0;
        loop {
            let config = avcodec_get_hw_config(codec, i);
            if config.is_null() {
                break;
            }
            i += 1;
            if ((*config).methods & HW_METHOD_DEVICE_CTX) == 0 {
                continue;
            }
            match explicit {
                Some(name) => {
                    let c_name = match CString::new(name) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    let wanted = av_hwdevice_find_type_by_name(c_name.as_ptr());
                    if wanted != AVHWDeviceType::AV_HWDEVICE_TYPE_NONE
                        && (*config).device_type == wanted
                    {
                        chosen = Some(((*config).device_type, (*config).pix_fmt));
                        break;
                    }
                }
                None => {
                    // First supported device type is the platform default.
                    chosen = Some(((*config).device_type, (*config).pix_fmt));
                    break;
                }
            }
        }

        let Some((device_type, pix_fmt)) = chosen else {
            debug!("decoder[{}] no matching hardware config, using software", self.id);
            return;
        };

        let mut device_ctx: *mut AVBufferRef = null_mut();
        let ret = av_hwdevice_ctx_create(&mut device_ctx, device_type, null_mut(), null_mut(), 0);
        if ret < 0 {
            warn!(
                "decoder[{}] hardware device open failed ({}), falling back to software",
                self.id,
                av_err2str(ret)
            );
            return;
        }

        self.hw_device_ctx = device_ctx;
        (*ctx).hw_device_ctx = av_buffer_ref(device_ctx);
        let hw_format = Box::new(HwFormat { pix_fmt });
        (*ctx).opaque = &*hw_format as *const HwFormat as *mut libc::c_void;
        (*ctx).get_format = Some(get_hw_format);
        self.hw_format = Some(hw_format);
    }

    fn handle_packet(&mut self, packet: &mut Packet) {
        unsafe {
            if (*packet.as_ptr()).stream_index != self.video_stream_index {
                return;
            }
        }

        let (data_ptr, size, pts, pos, flags) = unsafe {
            let p = packet.as_ptr();
            ((*p).data, (*p).size, (*p).pts, (*p).pos, (*p).flags)
        };
        if data_ptr.is_null() || size <= 0 {
            return;
        }
        let data = unsafe { std::slice::from_raw_parts(data_ptr, size as usize) };

        if self.waiting_keyframe {
            if is_keyframe(self.codec, data, (flags & AV_PKT_FLAG_KEY) != 0) {
                debug!("decoder[{}] first keyframe accepted", self.id);
                self.waiting_keyframe = false;
            } else {
                return;
            }
        }

        if matches!(self.codec, VideoCodec::H264 | VideoCodec::H265) {
            if let Some(payload) = read_sei(self.codec == VideoCodec::H265, data) {
                self.dispatch_sei(payload, pts, pos);
            }
        }

        self.retained.push_back(packet.clone());
        self.decode_and_dispatch(packet);
    }

    fn decode_and_dispatch(&mut self, packet: &Packet) {
        let ctx = self.active_ctx();
        if ctx.is_null() {
            self.retained.pop_front();
            return;
        }

        unsafe {
            let mut ret = avcodec_send_packet(ctx, packet.as_ptr());
            if ret == AVERROR_EOF {
                ret = 0;
            }
            if ret < 0 && ret != AVERROR(EAGAIN) {
                warn!(
                    "decoder[{}] send packet failed: {}",
                    self.id,
                    av_err2str(ret)
                );
                self.retained.pop_front();
                return;
            }

            loop {
                let mut frame = VideoFrame::empty();
                let ret = avcodec_receive_frame(ctx, frame.as_mut_ptr());
                if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                    break;
                }
                if ret < 0 {
                    warn!(
                        "decoder[{}] receive frame failed: {}",
                        self.id,
                        av_err2str(ret)
                    );
                    break;
                }

                if self.frames_decoded == 0 {
                    debug!(
                        "decoder[{}] first frame, {} packet(s) of codec delay",
                        self.id,
                        self.retained.len()
                    );
                }
                self.frames_decoded += 1;

                let mut frame = frame;
                if let Some(hw) = self.hw_format.as_deref() {
                    if (*frame.as_ptr()).format == hw.pix_fmt as i32
                        && self.options.download_hw_frames
                    {
                        match download_hw_frame(&frame) {
                            Ok(sw) => frame = sw,
                            Err(e) => {
                                error!("decoder[{}] hw download failed: {e}", self.id);
                                self.retained.pop_front();
                                continue;
                            }
                        }
                    }
                }

                let mut out_frames = Vec::new();
                match self.options.filter_desc().map(str::to_string) {
                    Some(desc) => {
                        if self.filter.is_none() {
                            match FrameFilter::from_frame(&desc, &frame, self.time_base) {
                                Ok(filter) => self.filter = Some(filter),
                                Err(e) => {
                                    error!(
                                        "decoder[{}] filter '{desc}' unusable: {e}",
                                        self.id
                                    );
                                }
                            }
                        }
                        match self.filter.as_mut() {
                            Some(filter) => match filter.filter(&mut frame) {
                                Ok(frames) => out_frames.extend(frames),
                                Err(e) => {
                                    error!("decoder[{}] filter failed: {e}", self.id);
                                    self.retained.pop_front();
                                    continue;
                                }
                            },
                            None => out_frames.push(frame),
                        }
                    }
                    None => out_frames.push(frame),
                }

                for frame in out_frames {
                    self.dispatch_frame(frame);
                }
            }
        }
    }

    fn dispatch_frame(&mut self, frame: VideoFrame) {
        // Ownership of the retained packet moves here; it is released
        // when this call returns.
        let packet = self.retained.pop_front().unwrap_or_else(Packet::empty);
        if let Some(observer) = self.observer.clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_decoded_frame(&packet, &frame);
        }
        if let Some(cb) = self.callbacks.on_decoded_frame.as_mut() {
            cb(&packet, &frame);
        }
    }

    fn dispatch_sei(&mut self, payload: Bytes, pts: i64, pos: i64) {
        if let Some(observer) = self.observer.clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_sei(payload.clone(), pts, pos);
        }
        if let Some(cb) = self.callbacks.on_sei.as_mut() {
            cb(payload, pts, pos);
        }
    }

    fn handle_eof(&mut self) {
        self.frames_decoded = 0;
        self.clear_packets();
        if let Some(observer) = self.observer.clone() {
            observer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .on_stream_eof();
        }
        if let Some(cb) = self.callbacks.on_eof.as_mut() {
            cb();
        }
    }

    fn handle_format_closed(&mut self) {
        self.clear_packets();
        self.filter = None;
        unsafe {
            if !self.dec_ctx.is_null() {
                avcodec_free_context(&mut self.dec_ctx);
            }
            if !self.hw_device_ctx.is_null() {
                av_buffer_unref(&mut self.hw_device_ctx);
            }
        }
        self.hw_format = None;
    }

    fn clear_packets(&mut self) {
        self.retained.clear();
    }
}

impl Drop for DecoderCore {
    fn drop(&mut self) {
        self.handle_format_closed();
    }
}

fn codec_family(id: AVCodecID) -> VideoCodec {
    match id {
        AVCodecID::AV_CODEC_ID_H264 => VideoCodec::H264,
        AVCodecID::AV_CODEC_ID_HEVC => VideoCodec::H265,
        _ => VideoCodec::Other,
    }
}

fn normalize_hw_name(name: &str) -> &str {
    match name {
        "nvenc" | "nvdec" => "cuda",
        other => other,
    }
}

fn download_hw_frame(frame: &VideoFrame) -> Result<VideoFrame> {
    let mut sw = VideoFrame::empty();
    unsafe {
        let ret = av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0);
        if ret < 0 {
            return Err(Error::Decoding(DecodingError::HwTransfer(AvError::new(ret))));
        }
        av_frame_copy_props(sw.as_mut_ptr(), frame.as_ptr());
    }
    Ok(sw)
}

/// Demuxer observer adapter; every event locks the core.
struct DemuxBridge(Arc<Mutex<DecoderCore>>);

impl DemuxerEvents for DemuxBridge {
    fn on_format_opened(&mut self, fmt_ctx: *mut AVFormatContext) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .handle_format_opened(fmt_ctx);
    }

    fn on_format_closed(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .handle_format_closed();
    }

    fn on_packet(&mut self, packet: &mut Packet) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .handle_packet(packet);
    }

    fn on_eof(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .handle_eof();
    }
}

/// Decoding driver: owns a demuxer and decodes its video stream.
pub struct StreamDecoder {
    core: Arc<Mutex<DecoderCore>>,
    demuxer: StreamDemuxer,
}

impl StreamDecoder {
    pub fn new(id: i32) -> Self {
        Self {
            core: Arc::new(Mutex::new(DecoderCore::new(id, null_mut()))),
            demuxer: StreamDemuxer::new(id),
        }
    }

    /// Decode through a caller-owned codec context instead of creating
    /// one from the stream parameters. The context must outlive the
    /// decoder and stays owned by the caller.
    pub fn with_external_context(id: i32, ctx: *mut AVCodecContext) -> Self {
        Self {
            core: Arc::new(Mutex::new(DecoderCore::new(id, ctx))),
            demuxer: StreamDemuxer::new(id),
        }
    }

    pub fn set_observer(&self, observer: Arc<Mutex<dyn DecoderEvents>>) {
        self.core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .observer = Some(observer);
    }

    pub fn set_decoded_frame_callback(
        &self,
        f: impl FnMut(&Packet, &VideoFrame) + Send + 'static,
    ) {
        self.core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .callbacks
            .on_decoded_frame = Some(Box::new(f));
    }

    pub fn set_sei_callback(&self, f: impl FnMut(Bytes, i64, i64) + Send + 'static) {
        self.core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .callbacks
            .on_sei = Some(Box::new(f));
    }

    pub fn set_eof_callback(&self, f: impl FnMut() + Send + 'static) {
        self.core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .callbacks
            .on_eof = Some(Box::new(f));
    }

    pub fn open_stream(
        &mut self,
        url: impl Into<String>,
        repeat: bool,
        sync_open: bool,
        options: DecoderOptions,
    ) -> Result<()> {
        self.core.lock().unwrap_or_else(|p| p.into_inner()).options = options;
        let bridge: Arc<Mutex<dyn DemuxerEvents>> =
            Arc::new(Mutex::new(DemuxBridge(self.core.clone())));
        self.demuxer.open_stream(url, Some(bridge), repeat, sync_open)
    }

    pub fn close_stream(&mut self, wait: bool) {
        self.demuxer.close_stream(wait);
    }

    pub fn video_codec_id(&self) -> AVCodecID {
        self.core.lock().unwrap_or_else(|p| p.into_inner()).codec_id
    }

    pub fn frames_decoded(&self) -> u64 {
        self.core
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .frames_decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_key_selection() {
        let mut options = DecoderOptions::default();
        assert!(options.filter_desc().is_none());

        options.options.push(("threads".into(), "4".into()));
        options.options.push(("vf".into(), "scale=640:480".into()));
        assert_eq!(options.filter_desc(), Some("scale=640:480"));

        let pairs = options.decoder_pairs();
        assert_eq!(pairs, vec![("threads", "4")]);
    }

    #[test]
    fn test_filter_key_precedence() {
        let options = DecoderOptions {
            options: vec![
                ("filter".into(), "hflip".into()),
                ("vf".into(), "vflip".into()),
            ],
            ..DecoderOptions::default()
        };
        assert_eq!(options.filter_desc(), Some("hflip"));
    }

    #[test]
    fn test_codec_family_mapping() {
        assert_eq!(codec_family(AVCodecID::AV_CODEC_ID_H264), VideoCodec::H264);
        assert_eq!(codec_family(AVCodecID::AV_CODEC_ID_HEVC), VideoCodec::H265);
        assert_eq!(codec_family(AVCodecID::AV_CODEC_ID_VP9), VideoCodec::Other);
    }

    #[test]
    fn test_hw_name_normalization() {
        assert_eq!(normalize_hw_name("nvenc"), "cuda");
        assert_eq!(normalize_hw_name("nvdec"), "cuda");
        assert_eq!(normalize_hw_name("vaapi"), "vaapi");
        assert_eq!(normalize_hw_name("videotoolbox"), "videotoolbox");
    }

    #[test]
    fn test_decoder_construction() {
        let decoder = StreamDecoder::new(7);
        assert_eq!(decoder.video_codec_id(), AVCodecID::AV_CODEC_ID_NONE);
        assert_eq!(decoder.frames_decoded(), 0);
    }
}
