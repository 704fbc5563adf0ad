// src/media/filter.rs - Per-stream video filter graph
//
// Built lazily from the first decoded frame: buffer source configured
// with that frame's geometry/pix_fmt/SAR (and hardware frames context
// when present), user filter description in the middle, buffersink at
// the end. Frames pushed in have their reference moved into the graph.

use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_sys_next::{
    av_buffersink_get_frame, av_buffersrc_add_frame, av_buffersrc_parameters_alloc,
    av_buffersrc_parameters_set, av_free, avfilter_get_by_name, avfilter_graph_alloc,
    avfilter_graph_config, avfilter_graph_create_filter, avfilter_graph_free,
    avfilter_graph_parse_ptr, avfilter_inout_alloc, avfilter_inout_free, AVFilterContext,
    AVFilterGraph, AVFilterInOut, AVRational, AVERROR, AVERROR_EOF, EAGAIN,
};
use log::{debug, error};
use std::ffi::CString;
use std::ptr::{null, null_mut};

use crate::error::{AvError, Error, FilterError, Result};

pub(crate) struct FrameFilter {
    graph: *mut AVFilterGraph,
    src: *mut AVFilterContext,
    sink: *mut AVFilterContext,
}

// SAFETY: the graph and its filter contexts are owned by the decoder
// thread that built them; never shared across threads.
unsafe impl Send for FrameFilter {}

impl FrameFilter {
    /// Build a graph for `description` using the properties of the
    /// first real frame plus the decoder time base.
    pub(crate) fn from_frame(
        description: &str,
        frame: &VideoFrame,
        time_base: AVRational,
    ) -> Result<Self> {
        let (width, height, format, sar) = unsafe {
            let f = frame.as_ptr();
            ((*f).width, (*f).height, (*f).format, (*f).sample_aspect_ratio)
        };
        let sar_den = if sar.den == 0 { 1 } else { sar.den };
        let tb_den = if time_base.den == 0 { 1 } else { time_base.den };

        let src_args = format!(
            "video_size={width}x{height}:pix_fmt={format}:time_base={}/{}:pixel_aspect={}/{}",
            time_base.num, tb_den, sar.num, sar_den
        );
        debug!("building filter graph '{description}' with source {src_args}");

        let desc_c = CString::new(description)
            .map_err(|_| Error::Filter(FilterError::NotAvailable("description")))?;
        let src_args_c = CString::new(src_args)
            .map_err(|_| Error::Filter(FilterError::NotAvailable("source args")))?;

        unsafe {
            let buffersrc = avfilter_get_by_name(c"buffer".as_ptr());
            let buffersink = avfilter_get_by_name(c"buffersink".as_ptr());
            if buffersrc.is_null() || buffersink.is_null() {
                return Err(Error::Filter(FilterError::NotAvailable("buffer/buffersink")));
            }

            let graph = avfilter_graph_alloc();
            if graph.is_null() {
                return Err(Error::Filter(FilterError::NotAvailable("graph alloc")));
            }
            let mut this = Self {
                graph,
                src: null_mut(),
                sink: null_mut(),
            };

            let mut ret = avfilter_graph_create_filter(
                &mut this.src,
                buffersrc,
                c"in".as_ptr(),
                src_args_c.as_ptr(),
                null_mut(),
                graph,
            );
            if ret < 0 {
                return Err(Error::Filter(FilterError::Build(AvError::new(ret))));
            }

            // Hardware-decoded streams carry their frames context into
            // the graph so hw filters can run without a download.
            let hw_frames_ctx = (*frame.as_ptr()).hw_frames_ctx;
            if !hw_frames_ctx.is_null() {
                let par = av_buffersrc_parameters_alloc();
                if !par.is_null() {
                    (*par).hw_frames_ctx = ffmpeg_sys_next::av_buffer_ref(hw_frames_ctx);
                    ret = av_buffersrc_parameters_set(this.src, par);
                    av_free(par.cast());
                    if ret < 0 {
                        return Err(Error::Filter(FilterError::Build(AvError::new(ret))));
                    }
                }
            }

            ret = avfilter_graph_create_filter(
                &mut this.sink,
                buffersink,
                c"out".as_ptr(),
                null(),
                null_mut(),
                graph,
            );
            if ret < 0 {
                return Err(Error::Filter(FilterError::Build(AvError::new(ret))));
            }

            // Wire "in" -> user description -> "out".
            let outputs = avfilter_inout_alloc();
            let inputs = avfilter_inout_alloc();
            if outputs.is_null() || inputs.is_null() {
                let mut o = outputs;
                let mut i = inputs;
                avfilter_inout_free(&mut o);
                avfilter_inout_free(&mut i);
                return Err(Error::Filter(FilterError::NotAvailable("inout alloc")));
            }
            (*outputs).name = ffmpeg_sys_next::av_strdup(c"in".as_ptr());
            (*outputs).filter_ctx = this.src;
            (*outputs).pad_idx = 0;
            (*outputs).next = null_mut();
            (*inputs).name = ffmpeg_sys_next::av_strdup(c"out".as_ptr());
            (*inputs).filter_ctx = this.sink;
            (*inputs).pad_idx = 0;
            (*inputs).next = null_mut();

            let mut inputs: *mut AVFilterInOut = inputs;
            let mut outputs: *mut AVFilterInOut = outputs;
            ret = avfilter_graph_parse_ptr(
                graph,
                desc_c.as_ptr(),
                &mut inputs,
                &mut outputs,
                null_mut(),
            );
            avfilter_inout_free(&mut inputs);
            avfilter_inout_free(&mut outputs);
            if ret < 0 {
                error!("filter graph parse failed for '{description}'");
                return Err(Error::Filter(FilterError::Build(AvError::new(ret))));
            }

            ret = avfilter_graph_config(graph, null_mut());
            if ret < 0 {
                return Err(Error::Filter(FilterError::Build(AvError::new(ret))));
            }

            Ok(this)
        }
    }

    /// Feed one frame (its reference moves into the graph) and pull all
    /// frames the graph has ready.
    pub(crate) fn filter(&mut self, frame: &mut VideoFrame) -> Result<Vec<VideoFrame>> {
        let mut out = Vec::new();
        unsafe {
            let ret = av_buffersrc_add_frame(self.src, frame.as_mut_ptr());
            if ret < 0 {
                return Err(Error::Filter(FilterError::Feed(AvError::new(ret))));
            }

            loop {
                let mut filtered = VideoFrame::empty();
                let ret = av_buffersink_get_frame(self.sink, filtered.as_mut_ptr());
                if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF {
                    break;
                }
                if ret < 0 {
                    return Err(Error::Filter(FilterError::Feed(AvError::new(ret))));
                }
                out.push(filtered);
            }
        }
        Ok(out)
    }
}

impl Drop for FrameFilter {
    fn drop(&mut self) {
        unsafe {
            avfilter_graph_free(&mut self.graph);
        }
    }
}
