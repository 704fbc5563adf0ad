// src/error.rs - Crate-wide error types
//
// Layering: operation-level enums (open/demux/decode/encode/mux/filter)
// wrap raw FFmpeg return codes; the top-level `Error` aggregates them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A raw FFmpeg error code paired with its `av_strerror` text.
#[derive(Debug, Clone, Error)]
#[error("{msg} (averror {code})")]
pub struct AvError {
    pub code: i32,
    pub msg: String,
}

impl AvError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            msg: crate::media::context::av_err2str(code),
        }
    }
}

impl From<i32> for AvError {
    fn from(code: i32) -> Self {
        Self::new(code)
    }
}

#[derive(Debug, Error)]
pub enum OpenInputError {
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to open input: {0}")]
    Av(AvError),
}

#[derive(Debug, Error)]
pub enum DemuxingError {
    #[error("demuxer thread could not be spawned")]
    ThreadSpawn,
}

#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("no video stream in input")]
    NoVideoStream,
    #[error("decoder not found for codec id {0}")]
    DecoderNotFound(i32),
    #[error("failed to open decoder: {0}")]
    Open(AvError),
    #[error("failed to download hardware frame: {0}")]
    HwTransfer(AvError),
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("encoder not found for name {0:?}")]
    EncoderNotFound(String),
    #[error("failed to open encoder: {0}")]
    Open(AvError),
    #[error("failed to encode frame: {0}")]
    Encode(AvError),
    #[error("encoder not initialized")]
    NotInitialized,
}

#[derive(Debug, Error)]
pub enum MuxingError {
    #[error("unsupported output url: {0}")]
    UnsupportedUrl(String),
    #[error("failed to allocate output context: {0}")]
    AllocOutput(AvError),
    #[error("failed to open output io: {0}")]
    OpenIo(AvError),
    #[error("failed to write header: {0}")]
    WriteHeader(AvError),
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter {0:?} not available")]
    NotAvailable(&'static str),
    #[error("failed to build filter graph: {0}")]
    Build(AvError),
    #[error("failed to feed filter graph: {0}")]
    Feed(AvError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    OpenInput(#[from] OpenInputError),
    #[error(transparent)]
    Demuxing(#[from] DemuxingError),
    #[error(transparent)]
    Decoding(#[from] DecodingError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Muxing(#[from] MuxingError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("buffer underflow: needed {needed} bytes, have {available}")]
    BufferUnderflow { needed: usize, available: usize },
}
