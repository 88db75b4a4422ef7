//! Streaming messages exchanged by the host and client pipelines.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::media::types::{CodecType, DisplayMode, ReconfigureRequest, Rotation};

// ── EncodedFrame ──────────────────────────────────────────────────

/// One compressed picture from host to client.
///
/// Immutable once built. `picture_id` strictly increases within one
/// host pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedFrame {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub is_keyframe: bool,
    pub picture_id: u64,

    /// Host clock, microseconds.
    pub capture_ts_us: u64,
    pub start_encode_ts_us: u64,
    pub end_encode_ts_us: u64,

    /// Opaque codec bitstream.
    pub payload: Bytes,
}

impl EncodedFrame {
    /// Time spent inside the encoder.
    pub fn encode_duration_us(&self) -> u64 {
        self.end_encode_ts_us.saturating_sub(self.start_encode_ts_us)
    }
}

// ── ReconfigureEncoder ────────────────────────────────────────────

/// Explicit bitrate-mode switch carried by a reconfigure request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconfigureTrigger {
    /// Hand bitrate control back to the automatic controller.
    TurnOnAuto,
    /// The user picked a bitrate; automatic changes stop until
    /// `TurnOnAuto`.
    TurnOffAuto,
}

/// Request to change the encoder's rate parameters.
///
/// A request without a trigger is an automatic adjustment and is
/// rejected while the host is in manual mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReconfigureEncoder {
    pub trigger: Option<ReconfigureTrigger>,
    pub bitrate_bps: Option<u64>,
    pub fps: Option<u32>,
}

impl ReconfigureEncoder {
    /// Automatic adjustment (no mode change).
    pub fn auto(bitrate_bps: u64) -> Self {
        Self {
            trigger: None,
            bitrate_bps: Some(bitrate_bps),
            fps: None,
        }
    }

    /// User-selected bitrate; switches the host to manual mode.
    pub fn manual(bitrate_bps: u64) -> Self {
        Self {
            trigger: Some(ReconfigureTrigger::TurnOffAuto),
            bitrate_bps: Some(bitrate_bps),
            fps: None,
        }
    }

    /// Return control to the automatic controller.
    pub fn turn_on_auto() -> Self {
        Self {
            trigger: Some(ReconfigureTrigger::TurnOnAuto),
            bitrate_bps: None,
            fps: None,
        }
    }

    /// Set the target frame rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    /// The rate patch carried by this message.
    pub fn request(&self) -> ReconfigureRequest {
        ReconfigureRequest {
            bitrate_bps: self.bitrate_bps,
            fps: self.fps,
        }
    }
}

// ── ChangeStreamingParams ─────────────────────────────────────────

/// Proposes a new display mode. The receiver acknowledges with the
/// same parameters before either side trusts a rebuilt pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeStreamingParams {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub rotation: Rotation,
}

impl From<DisplayMode> for ChangeStreamingParams {
    fn from(mode: DisplayMode) -> Self {
        Self {
            width: mode.width,
            height: mode.height,
            refresh_rate: mode.refresh_rate,
            rotation: mode.rotation,
        }
    }
}

impl From<ChangeStreamingParams> for DisplayMode {
    fn from(p: ChangeStreamingParams) -> Self {
        DisplayMode {
            width: p.width,
            height: p.height,
            refresh_rate: p.refresh_rate,
            rotation: p.rotation,
        }
    }
}

// ── SendSideStat ──────────────────────────────────────────────────

/// Client → host transport feedback driving automatic bitrate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SendSideStat {
    /// NACKs observed since the previous report.
    pub nack: u32,
    /// Bandwidth estimate in bits/second.
    pub bwe_bps: u64,
    /// Packet loss fraction, 0.0 – 1.0.
    pub loss_rate: f32,
}

// ── CursorInfo ────────────────────────────────────────────────────

/// Distinct dedup ids either side remembers. Both caches start over
/// when a new bitmap would exceed it, so they stay in step.
pub const CURSOR_CACHE_ENTRIES: usize = 256;

/// A cursor bitmap in BGRA8, tightly packed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorBitmap {
    pub width: u32,
    pub height: u32,
    pub hotspot_x: u32,
    pub hotspot_y: u32,
    pub data: Bytes,
}

/// How the cursor image is conveyed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CursorShape {
    /// A system cursor by id.
    Preset(u32),
    /// A bitmap seen for the first time, tagged with a dedup id.
    Bitmap { bitmap: CursorBitmap, dedup_id: u32 },
    /// A bitmap the client already has, referenced by dedup id.
    Cached(u32),
}

/// Cursor position, visibility and shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorInfo {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub shape: CursorShape,
}

// ── Message ───────────────────────────────────────────────────────

/// Every message the pipeline core produces or consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    EncodedFrame(EncodedFrame),
    RequestKeyframe,
    ReconfigureEncoder(ReconfigureEncoder),
    ChangeStreamingParams(ChangeStreamingParams),
    ChangeStreamingParamsAck(ChangeStreamingParams),
    SendSideStat(SendSideStat),
    CursorInfo(CursorInfo),
}

impl Message {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StreamError> {
        bincode::serialize(self).map_err(|e| StreamError::Encoding(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StreamError> {
        bincode::deserialize(bytes).map_err(|e| StreamError::Encoding(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::EncodedFrame(_) => "EncodedFrame",
            Message::RequestKeyframe => "RequestKeyframe",
            Message::ReconfigureEncoder(_) => "ReconfigureEncoder",
            Message::ChangeStreamingParams(_) => "ChangeStreamingParams",
            Message::ChangeStreamingParamsAck(_) => "ChangeStreamingParamsAck",
            Message::SendSideStat(_) => "SendSideStat",
            Message::CursorInfo(_) => "CursorInfo",
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
