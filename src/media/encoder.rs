// src/media/encoder.rs - Encoder with hardware-preference probing
//
// Codec resolution walks a candidate list: hardware names for the
// family (explicit backend first, else platform order), the exact name
// as given, common software names, and finally lookup by codec id.
// `request_keyframe` marks the next submitted frame as an I-frame.

use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::packet::Mut as PacketMut;
use ffmpeg_next::Packet;
use ffmpeg_sys_next::{
    avcodec_alloc_context3, avcodec_find_encoder, avcodec_find_encoder_by_name,
    avcodec_free_context, avcodec_open2, avcodec_receive_packet, avcodec_send_frame, AVCodec,
    AVCodecContext, AVCodecID, AVMediaType, AVPictureType, AVPixelFormat, AVRational, AVERROR,
    AVERROR_EOF, AV_FRAME_FLAG_KEY, EAGAIN,
};
use log::{error, info};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::error::{AvError, EncodingError, Error, Result};
use crate::media::context::{av_err2str, dict_from_pairs};

/// Everything the encoder accepts directly; unknown knobs ride along in
/// `options` and reach the codec untouched.
#[derive(Clone)]
pub struct EncodeParam {
    pub codec_name: String,
    pub width: i32,
    pub height: i32,
    pub time_base: AVRational,
    /// Optional; `num == 0` means unknown.
    pub frame_rate: AVRational,
    pub pix_fmt: AVPixelFormat,
    /// bps; 0 leaves rate control to crf/qp.
    pub bit_rate: i64,
    pub gop_size: i32,
    /// Negative keeps the encoder default.
    pub max_b_frames: i32,
    pub thread_count: i32,
    /// 0..=51; negative disables.
    pub crf: i32,
    pub qp: i32,
    pub preset: String,
    pub tune: String,
    pub profile: String,
    pub options: BTreeMap<String, String>,
    pub prefer_hardware: bool,
    /// videotoolbox / nvenc / cuda / qsv / amf / vaapi; empty follows
    /// the platform preference order.
    pub hw_accel: String,
}

impl Default for EncodeParam {
    fn default() -> Self {
        Self {
            codec_name: "h264".into(),
            width: 0,
            height: 0,
            time_base: AVRational { num: 1, den: 90_000 },
            frame_rate: AVRational { num: 0, den: 1 },
            pix_fmt: AVPixelFormat::AV_PIX_FMT_YUV420P,
            bit_rate: 0,
            gop_size: 0,
            max_b_frames: -1,
            thread_count: 0,
            crf: -1,
            qp: -1,
            preset: String::new(),
            tune: String::new(),
            profile: String::new(),
            options: BTreeMap::new(),
            prefer_hardware: true,
            hw_accel: String::new(),
        }
    }
}

/// Aliases collapse onto the codec family name.
fn normalize_codec_name(name: &str) -> String {
    match name.to_ascii_lowercase().as_str() {
        "h265" | "x265" => "hevc".to_string(),
        "x264" => "h264".to_string(),
        other => other.to_string(),
    }
}

fn hw_names_for_family(family: &str, hw_accel: &str, out: &mut Vec<String>) {
    if family != "h264" && family != "hevc" {
        return;
    }
    let accel = hw_accel.to_ascii_lowercase();
    if !accel.is_empty() {
        let suffix = match accel.as_str() {
            "videotoolbox" => Some("videotoolbox"),
            "nvenc" | "cuda" => Some("nvenc"),
            "qsv" => Some("qsv"),
            "amf" => Some("amf"),
            "vaapi" => Some("vaapi"),
            _ => None,
        };
        if let Some(suffix) = suffix {
            out.push(format!("{family}_{suffix}"));
        }
        return;
    }

    #[cfg(target_os = "macos")]
    out.push(format!("{family}_videotoolbox"));
    out.push(format!("{family}_nvenc"));
    out.push(format!("{family}_qsv"));
    out.push(format!("{family}_amf"));
    out.push(format!("{family}_vaapi"));
}

/// The probe list, hardware first when requested, exact name, then the
/// common software encoders.
fn candidate_names(codec_name: &str, prefer_hardware: bool, hw_accel: &str) -> Vec<String> {
    let family = normalize_codec_name(codec_name);
    let mut names = Vec::new();

    if prefer_hardware {
        hw_names_for_family(&family, hw_accel, &mut names);
    }
    names.push(family.clone());
    match family.as_str() {
        "h264" => names.push("libx264".to_string()),
        "hevc" => names.push("libx265".to_string()),
        "mjpeg" => names.push("mjpeg".to_string()),
        "mpeg4" => names.push("mpeg4".to_string()),
        _ => {}
    }
    names.dedup();
    names
}

fn fallback_codec_id(family: &str) -> Option<AVCodecID> {
    match family {
        "h264" | "libx264" => Some(AVCodecID::AV_CODEC_ID_H264),
        "hevc" | "libx265" => Some(AVCodecID::AV_CODEC_ID_HEVC),
        "mjpeg" | "jpeg" => Some(AVCodecID::AV_CODEC_ID_MJPEG),
        "mpeg4" => Some(AVCodecID::AV_CODEC_ID_MPEG4),
        _ => None,
    }
}

fn resolve_codec(param: &EncodeParam) -> Option<*const AVCodec> {
    for name in candidate_names(&param.codec_name, param.prefer_hardware, &param.hw_accel) {
        let Ok(c_name) = CString::new(name) else { continue };
        let codec = unsafe { avcodec_find_encoder_by_name(c_name.as_ptr()) };
        if !codec.is_null() {
            return Some(codec);
        }
    }
    let family = normalize_codec_name(&param.codec_name);
    fallback_codec_id(&family).and_then(|id| {
        let codec = unsafe { avcodec_find_encoder(id) };
        (!codec.is_null()).then_some(codec as *const AVCodec)
    })
}

pub struct StreamEncoder {
    ctx: *mut AVCodecContext,
    force_idr: AtomicBool,
    frame_count: AtomicU64,
    start: Instant,
}

// SAFETY: the codec context is owned exclusively; encode() takes &mut,
// so FFI calls are serialized by the borrow checker.
unsafe impl Send for StreamEncoder {}

impl StreamEncoder {
    pub fn new() -> Self {
        Self {
            ctx: null_mut(),
            force_idr: AtomicBool::new(false),
            frame_count: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn init(&mut self, param: &EncodeParam) -> Result<()> {
        let codec = resolve_codec(param)
            .ok_or_else(|| Error::Encoding(EncodingError::EncoderNotFound(param.codec_name.clone())))?;

        unsafe {
            let ctx = avcodec_alloc_context3(codec);
            if ctx.is_null() {
                return Err(Error::Encoding(EncodingError::EncoderNotFound(
                    param.codec_name.clone(),
                )));
            }

            (*ctx).codec_type = AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*ctx).codec_id = (*codec).id;
            (*ctx).width = param.width;
            (*ctx).height = param.height;
            (*ctx).time_base = if param.time_base.num > 0 {
                param.time_base
            } else {
                AVRational { num: 1, den: 90_000 }
            };
            if param.frame_rate.num > 0 && param.frame_rate.den > 0 {
                (*ctx).framerate = param.frame_rate;
            }
            (*ctx).pix_fmt = param.pix_fmt;
            if param.bit_rate > 0 {
                (*ctx).bit_rate = param.bit_rate;
            }
            if param.gop_size > 0 {
                (*ctx).gop_size = param.gop_size;
            }
            if param.max_b_frames >= 0 {
                (*ctx).max_b_frames = param.max_b_frames;
            }
            if param.thread_count > 0 {
                (*ctx).thread_count = param.thread_count;
            }

            let mut pairs: Vec<(String, String)> = param
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !param.preset.is_empty() {
                pairs.push(("preset".into(), param.preset.clone()));
            }
            if !param.tune.is_empty() {
                pairs.push(("tune".into(), param.tune.clone()));
            }
            if !param.profile.is_empty() {
                pairs.push(("profile".into(), param.profile.clone()));
            }
            if param.crf >= 0 {
                pairs.push(("crf".into(), param.crf.to_string()));
            }
            if param.qp >= 0 {
                // Encoders disagree on the knob name; set both.
                pairs.push(("qp".into(), param.qp.to_string()));
                pairs.push(("q".into(), param.qp.to_string()));
            }
            let pair_refs: Vec<(&str, &str)> = pairs
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            let mut opts = dict_from_pairs(&pair_refs);

            let ret = avcodec_open2(ctx, codec, &mut opts);
            ffmpeg_sys_next::av_dict_free(&mut opts);
            if ret < 0 {
                error!("encoder open failed: {}", av_err2str(ret));
                let mut ctx = ctx;
                avcodec_free_context(&mut ctx);
                return Err(Error::Encoding(EncodingError::Open(AvError::new(ret))));
            }

            self.close();
            self.ctx = ctx;
            info!(
                "encoder opened: {} {}x{} tb={}/{} br={} gop={}",
                param.codec_name,
                (*ctx).width,
                (*ctx).height,
                (*ctx).time_base.num,
                (*ctx).time_base.den,
                (*ctx).bit_rate,
                (*ctx).gop_size
            );
        }

        self.frame_count.store(0, Ordering::Relaxed);
        self.start = Instant::now();
        Ok(())
    }

    /// Submit one frame (None flushes) and receive at most one packet.
    pub fn encode(&mut self, frame: Option<&mut VideoFrame>) -> Result<Option<Packet>> {
        if self.ctx.is_null() {
            return Err(Error::Encoding(EncodingError::NotInitialized));
        }

        unsafe {
            let frame_ptr = match frame {
                Some(frame) => {
                    if self.force_idr.swap(false, Ordering::Relaxed) {
                        let raw = frame.as_mut_ptr();
                        (*raw).pict_type = AVPictureType::AV_PICTURE_TYPE_I;
                        (*raw).flags |= AV_FRAME_FLAG_KEY as libc::c_int;
                        (*raw).key_frame = 1;
                    }
                    frame.as_mut_ptr() as *const _
                }
                None => null(),
            };

            let ret = avcodec_send_frame(self.ctx, frame_ptr);
            if ret < 0 && ret != AVERROR(EAGAIN) && ret != AVERROR_EOF {
                return Err(Error::Encoding(EncodingError::Encode(AvError::new(ret))));
            }

            let mut packet = Packet::empty();
            let ret = avcodec_receive_packet(self.ctx, packet.as_mut_ptr());
            if ret == 0 {
                self.frame_count.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(packet));
            }
            if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                return Ok(None);
            }
            Err(Error::Encoding(EncodingError::Encode(AvError::new(ret))))
        }
    }

    /// Mark the next submitted frame as an IDR request.
    pub fn request_keyframe(&self) {
        self.force_idr.store(true, Ordering::Relaxed);
    }

    /// Cumulative average since init: `(fps, frames, elapsed_seconds)`.
    pub fn fps(&self) -> (f64, u64, f64) {
        let frames = self.frame_count.load(Ordering::Relaxed);
        let elapsed = self.start.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            frames as f64 / elapsed
        } else {
            0.0
        };
        (fps, frames, elapsed)
    }

    fn close(&mut self) {
        if !self.ctx.is_null() {
            unsafe {
                avcodec_free_context(&mut self.ctx);
            }
        }
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_normalization() {
        assert_eq!(normalize_codec_name("H265"), "hevc");
        assert_eq!(normalize_codec_name("x264"), "h264");
        assert_eq!(normalize_codec_name("x265"), "hevc");
        assert_eq!(normalize_codec_name("mjpeg"), "mjpeg");
    }

    #[test]
    fn test_candidates_with_explicit_backend() {
        let names = candidate_names("h264", true, "nvenc");
        assert_eq!(names[0], "h264_nvenc");
        assert!(names.contains(&"h264".to_string()));
        assert_eq!(names.last().unwrap(), "libx264");
    }

    #[test]
    fn test_candidates_platform_order_without_backend() {
        let names = candidate_names("hevc", true, "");
        let nvenc = names.iter().position(|n| n == "hevc_nvenc").unwrap();
        let qsv = names.iter().position(|n| n == "hevc_qsv").unwrap();
        let vaapi = names.iter().position(|n| n == "hevc_vaapi").unwrap();
        assert!(nvenc < qsv && qsv < vaapi);
        assert_eq!(names.last().unwrap(), "libx265");
    }

    #[test]
    fn test_candidates_software_only() {
        let names = candidate_names("h264", false, "nvenc");
        assert_eq!(names, vec!["h264".to_string(), "libx264".to_string()]);
    }

    #[test]
    fn test_candidates_unknown_family_passthrough() {
        let names = candidate_names("prores", true, "");
        assert_eq!(names, vec!["prores".to_string()]);
    }

    #[test]
    fn test_fallback_ids() {
        assert_eq!(fallback_codec_id("h264"), Some(AVCodecID::AV_CODEC_ID_H264));
        assert_eq!(fallback_codec_id("jpeg"), Some(AVCodecID::AV_CODEC_ID_MJPEG));
        assert_eq!(fallback_codec_id("prores"), None);
    }

    #[test]
    fn test_encode_before_init_fails() {
        let mut encoder = StreamEncoder::new();
        assert!(matches!(
            encoder.encode(None),
            Err(Error::Encoding(EncodingError::NotInitialized))
        ));
    }

    #[test]
    fn test_fps_starts_at_zero_frames() {
        let encoder = StreamEncoder::new();
        let (_, frames, _) = encoder.fps();
        assert_eq!(frames, 0);
    }
}
