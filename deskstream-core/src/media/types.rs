//! Shared types for the capture → encode → decode → render pipeline.
//!
//! These are **internal** frame representations passed between
//! pipeline stages and their collaborators. They are distinct from the
//! serialisable *wire* types in [`crate::protocol`], which is what
//! actually crosses the network.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::CursorBitmap;

// ── Clock ────────────────────────────────────────────────────────

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process.
///
/// All pipeline timestamps (capture, encode, arrival) use this clock.
pub fn now_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

// ── CodecType ────────────────────────────────────────────────────

/// Video codecs a pipeline can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    H264,
    H265,
    /// Lossless zstd frame codec, always available in software.
    Zstd,
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecType::H264 => write!(f, "h264"),
            CodecType::H265 => write!(f, "h265"),
            CodecType::Zstd => write!(f, "zstd"),
        }
    }
}

impl std::str::FromStr for CodecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(CodecType::H264),
            "h265" | "hevc" => Ok(CodecType::H265),
            "zstd" => Ok(CodecType::Zstd),
            other => Err(format!("unknown codec '{other}'")),
        }
    }
}

// ── BackendKind ──────────────────────────────────────────────────

/// The closed set of encoder/decoder backends.
///
/// A backend is selected once when a pipeline is constructed; after
/// that callers only ever hold a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Nvidia,
    Amd,
    Intel,
    Software,
}

impl BackendKind {
    pub const fn is_hardware(self) -> bool {
        !matches!(self, BackendKind::Software)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Nvidia => write!(f, "nvidia"),
            BackendKind::Amd => write!(f, "amd"),
            BackendKind::Intel => write!(f, "intel"),
            BackendKind::Software => write!(f, "software"),
        }
    }
}

// ── EncodeAbility ────────────────────────────────────────────────

/// One (codec, backend) pair a sender can encode with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodeAbility {
    pub codec: CodecType,
    pub backend: BackendKind,
}

impl EncodeAbility {
    pub const fn new(codec: CodecType, backend: BackendKind) -> Self {
        Self { codec, backend }
    }
}

// ── Display mode ─────────────────────────────────────────────────

/// Screen rotation, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// A display mode as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub rotation: Rotation,
}

impl DisplayMode {
    pub const fn new(width: u32, height: u32, refresh_rate: u32) -> Self {
        Self {
            width,
            height,
            refresh_rate,
            rotation: Rotation::Deg0,
        }
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh_rate)
    }
}

// ── NegotiatedParams ─────────────────────────────────────────────

/// Parameters fixed for the lifetime of one pipeline instance.
///
/// Any change means destroying and recreating the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedParams {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub rotation: Rotation,
    pub codec: CodecType,
    pub backend: BackendKind,
    /// Stretch the picture to the client surface instead of
    /// letterboxing.
    pub stretch: bool,
}

impl NegotiatedParams {
    pub fn new(mode: DisplayMode, ability: EncodeAbility, stretch: bool) -> Self {
        Self {
            width: mode.width,
            height: mode.height,
            refresh_rate: mode.refresh_rate,
            rotation: mode.rotation,
            codec: ability.codec,
            backend: ability.backend,
            stretch,
        }
    }

    pub fn display_mode(&self) -> DisplayMode {
        DisplayMode {
            width: self.width,
            height: self.height,
            refresh_rate: self.refresh_rate,
            rotation: self.rotation,
        }
    }
}

// ── PixelFormat / CaptureFormat ──────────────────────────────────

/// Pixel layout of captured and decoded surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// Planar luma + interleaved half-resolution chroma.
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for a tightly packed `width × height` image.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        let px = width as usize * height as usize;
        match self {
            PixelFormat::Bgra8 => px * 4,
            PixelFormat::Nv12 => px + px / 2,
        }
    }
}

/// What an encoder wants the capturer to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureFormat {
    pub pixel: PixelFormat,
    /// Software encoders need a CPU-readable copy; hardware encoders
    /// consume GPU surfaces directly.
    pub cpu_readable: bool,
}

// ── CapturedFrame ────────────────────────────────────────────────

/// Opaque handle to a native GPU surface owned by the capturer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Where the pixels of a captured frame live.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// A GPU surface; only meaningful to the device it came from.
    Surface(SurfaceHandle),
    /// A CPU copy with `stride` bytes per row.
    Cpu { stride: u32, data: Bytes },
}

/// A frame obtained from the capturer.
///
/// Owned by the capturer until handed back through
/// `Capturer::done_with_frame`.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: FrameData,
    /// Capture timestamp, see [`now_us`].
    pub timestamp_us: u64,
}

// ── Decoded output ───────────────────────────────────────────────

/// Identifier of a renderer-consumable texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

/// Result status of one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStatus {
    Ok,
    /// This picture could not be decoded; a keyframe resynchronises.
    Failed,
    /// The decoder cannot make progress; the pipeline must be rebuilt.
    EAgain,
    /// The decoder lost its state; the pipeline must be rebuilt.
    NeedReset,
}

/// Output of one decode call. Only `Ok` carries a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub status: DecodeStatus,
    pub resource: Option<ResourceId>,
}

impl DecodedFrame {
    pub const fn ok(resource: ResourceId) -> Self {
        Self {
            status: DecodeStatus::Ok,
            resource: Some(resource),
        }
    }

    pub const fn failed() -> Self {
        Self::with_status(DecodeStatus::Failed)
    }

    pub const fn with_status(status: DecodeStatus) -> Self {
        Self {
            status,
            resource: None,
        }
    }
}

// ── Render-side state ────────────────────────────────────────────

/// Outcome of a renderer or overlay draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Success,
    /// The overlay subsystem must be reinitialised; decode and capture
    /// state are unaffected.
    Reset,
    /// Unrecoverable: the render thread exits.
    Failed,
}

/// How local mouse input maps to the remote pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MouseMode {
    #[default]
    Absolute,
    Relative,
}

/// Cursor image as the renderer sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorImage {
    Preset(u32),
    Bitmap(Arc<CursorBitmap>),
}

/// Cursor position, visibility and image.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub image: CursorImage,
}

/// Cursor as fetched from the host desktop, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSnapshot {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub image: CursorSource,
}

/// Cursor shape as captured.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorSource {
    /// A system cursor identified by id.
    Preset(u32),
    Bitmap(CursorBitmap),
}

// ── ReconfigureRequest ───────────────────────────────────────────

/// A sparse patch to the encoder's rate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconfigureRequest {
    pub bitrate_bps: Option<u64>,
    pub fps: Option<u32>,
}

impl ReconfigureRequest {
    pub fn is_empty(&self) -> bool {
        self.bitrate_bps.is_none() && self.fps.is_none()
    }
}

// ── Tests ────────────────────────────────────────────────────────
