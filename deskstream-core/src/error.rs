//! Domain-specific error types for the streaming pipeline.
//!
//! All fallible operations return `Result<T, StreamError>`. The first
//! group of variants is the pipeline failure taxonomy: each one tells
//! the owning layer whether to absorb the failure, request a keyframe,
//! or tear the pipeline down and rebuild it.

use std::time::Duration;
use thiserror::Error;

use crate::media::types::{CodecType, DecodeStatus};

/// The canonical error type for deskstream.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Pipeline taxonomy ────────────────────────────────────────
    /// No codec in the receiver's preference list is offered by the
    /// sender. Fatal: no pipeline is created on either side.
    #[error("capability negotiation failed: sender offers none of {preferred:?}")]
    NegotiationFailure { preferred: Vec<CodecType> },

    /// Every hardware backend and the software fallback refused to
    /// create an encoder.
    #[error("encoder creation failed: {0}")]
    EncoderCreateFailure(String),

    /// A single decode call failed. Recoverable with one keyframe.
    #[error("decode failed for picture {picture_id}")]
    DecodeFailure { picture_id: u64 },

    /// The decoder reported `EAgain` or `NeedReset`. The owner must
    /// rebuild the whole pipeline instance.
    #[error("decoder needs a pipeline rebuild ({status:?})")]
    DecodeFatal { status: DecodeStatus },

    /// The render target could not be recreated after device loss.
    #[error("render device lost")]
    RenderDeviceLost,

    /// The renderer failed permanently; the stream has ended.
    #[error("render failed")]
    RenderFatal,

    /// The host display mode no longer matches the negotiated one.
    #[error("display mode changed to {width}x{height}@{refresh_rate}")]
    ResolutionChanged {
        width: u32,
        height: u32,
        refresh_rate: u32,
    },

    // ── Lifecycle errors ─────────────────────────────────────────
    /// A pipeline was created with missing or nonsensical parameters.
    #[error("invalid pipeline parameters: {0}")]
    InvalidParams(&'static str),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The capturer refused to start.
    #[error("capture failed to start: {0}")]
    CaptureStart(String),

    // ── Transport-facing errors ──────────────────────────────────
    /// Encoding or decoding of a wire message failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The OS reported an I/O error (thread spawn, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An event channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Whether this failure leaves a codec or renderer in an unknown
    /// state, so the owner must rebuild rather than continue.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            StreamError::DecodeFatal { .. }
                | StreamError::ResolutionChanged { .. }
                | StreamError::RenderDeviceLost
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for StreamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StreamError::Encoding(e.to_string())
    }
}
