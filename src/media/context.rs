// src/media/context.rs - Owned FFmpeg context wrappers and FFI helpers

use ffmpeg_sys_next::{
    av_dict_set, av_strerror, avformat_close_input, avformat_free_context,
    avformat_network_init, AVDictionary, AVFormatContext, AVIOContext, avio_closep, AVFMT_NOFILE,
};
use std::ffi::{CStr, CString};
use std::ptr::null_mut;
use std::sync::Once;

const ERRBUF_SIZE: usize = 64;

/// Text for an FFmpeg error code via `av_strerror`.
pub fn av_err2str(code: i32) -> String {
    let mut buf = [0 as libc::c_char; ERRBUF_SIZE];
    unsafe {
        if av_strerror(code, buf.as_mut_ptr(), ERRBUF_SIZE) < 0 {
            return format!("unknown error {code}");
        }
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

/// One-time process-wide FFmpeg network initialization.
pub fn ensure_ffmpeg_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        avformat_network_init();
    });
}

/// Build an `AVDictionary` from key/value pairs. The caller owns the
/// returned dictionary and frees it with `av_dict_free`.
pub(crate) fn dict_from_pairs(pairs: &[(&str, &str)]) -> *mut AVDictionary {
    let mut dict: *mut AVDictionary = null_mut();
    for (key, value) in pairs {
        let (Ok(key), Ok(value)) = (CString::new(*key), CString::new(*value)) else {
            continue;
        };
        unsafe {
            av_dict_set(&mut dict, key.as_ptr(), value.as_ptr(), 0);
        }
    }
    dict
}

/// Owns an input `AVFormatContext`; closed via `avformat_close_input`.
pub(crate) struct InputFormatContext {
    pub(crate) fmt_ctx: *mut AVFormatContext,
}

// SAFETY: the context is owned exclusively by the driver thread that
// created it; no other thread dereferences the pointer. FFmpeg format
// contexts carry no thread affinity once opened.
unsafe impl Send for InputFormatContext {}

impl InputFormatContext {
    pub(crate) fn new(fmt_ctx: *mut AVFormatContext) -> Self {
        Self { fmt_ctx }
    }
}

impl Drop for InputFormatContext {
    fn drop(&mut self) {
        if !self.fmt_ctx.is_null() {
            unsafe {
                avformat_close_input(&mut self.fmt_ctx);
            }
        }
    }
}

/// Owns an output `AVFormatContext` plus its avio handle.
pub(crate) struct OutputFormatContext {
    pub(crate) fmt_ctx: *mut AVFormatContext,
    pub(crate) io_open: bool,
}

// SAFETY: same exclusive-ownership argument as InputFormatContext; the
// writer thread is the only dereferencer after construction.
unsafe impl Send for OutputFormatContext {}

impl OutputFormatContext {
    pub(crate) fn new(fmt_ctx: *mut AVFormatContext) -> Self {
        Self {
            fmt_ctx,
            io_open: false,
        }
    }

    pub(crate) fn needs_io_open(&self) -> bool {
        unsafe { !self.fmt_ctx.is_null() && ((*(*self.fmt_ctx).oformat).flags & AVFMT_NOFILE) == 0 }
    }

    pub(crate) fn close_io(&mut self) {
        if self.io_open && !self.fmt_ctx.is_null() {
            unsafe {
                let pb: *mut *mut AVIOContext = &mut (*self.fmt_ctx).pb;
                avio_closep(pb);
            }
            self.io_open = false;
        }
    }
}

impl Drop for OutputFormatContext {
    fn drop(&mut self) {
        self.close_io();
        if !self.fmt_ctx.is_null() {
            unsafe {
                avformat_free_context(self.fmt_ctx);
            }
            self.fmt_ctx = null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_av_err2str_known_code() {
        // AVERROR(EINVAL)
        let msg = av_err2str(ffmpeg_sys_next::AVERROR(libc::EINVAL));
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_dict_from_pairs_skips_interior_nul() {
        let dict = dict_from_pairs(&[("rtsp_transport", "tcp"), ("bad\0key", "x")]);
        unsafe {
            let entry = ffmpeg_sys_next::av_dict_get(
                dict,
                c"rtsp_transport".as_ptr(),
                std::ptr::null(),
                0,
            );
            assert!(!entry.is_null());
            let mut dict = dict;
            ffmpeg_sys_next::av_dict_free(&mut dict);
        }
    }
}
