//! Encoder collaborator and the software zstd encoder.
//!
//! The host pipeline never names a concrete encoder. It asks an
//! [`EncoderFactory`] for one (hardware backends first, software last)
//! and keeps the resulting `Box<dyn Encoder>` for its whole lifetime.
//!
//! [`ZstdEncoder`] is the software path:
//!
//! - **Keyframe**: rows packed tightly (no stride padding) → zstd.
//! - **Delta frame**: XOR against the previous packed frame → zstd.
//!   Static regions become runs of zeros and compress to almost nothing.
//!
//! The bitrate target is mapped onto the zstd compression level.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::media::device::BorrowedDevice;
use crate::media::types::{
    BackendKind, CaptureFormat, CapturedFrame, CodecType, EncodeAbility, FrameData, PixelFormat,
    ReconfigureRequest,
};

// ── Encoder contract ─────────────────────────────────────────────

/// Parameters an encoder is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u64,
    /// The capturer's device; encoders never own it.
    pub device: BorrowedDevice,
}

/// Bitstream produced by one `encode` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedOutput {
    pub payload: Bytes,
    pub is_keyframe: bool,
}

/// A video encoder bound to one codec and backend.
pub trait Encoder: Send {
    fn backend(&self) -> BackendKind;

    fn codec(&self) -> CodecType;

    /// Encode one frame. `None` means the encoder produced no output
    /// for this frame (it is skipped, not fatal).
    fn encode(&mut self, frame: &CapturedFrame) -> Option<EncodedOutput>;

    /// Apply a rate patch. Returns `false` if the encoder rejected it.
    fn reconfigure(&mut self, request: &ReconfigureRequest) -> bool;

    /// Make the next output an IDR frame.
    fn request_keyframe(&mut self);

    /// The capture format this encoder consumes.
    fn capture_format(&self) -> CaptureFormat;
}

/// Creates encoders for the host pipeline.
pub trait EncoderFactory: Send + Sync {
    /// Every (codec, backend) pair this host can encode, hardware
    /// entries before software ones.
    fn abilities(&self) -> Vec<EncodeAbility>;

    /// Hardware backends in host-preferred order.
    fn hardware_backends(&self) -> Vec<BackendKind>;

    fn create_hard(&self, backend: BackendKind, params: &EncoderParams) -> Option<Box<dyn Encoder>>;

    fn create_soft(&self, params: &EncoderParams) -> Option<Box<dyn Encoder>>;
}

// ── ZstdEncoder ──────────────────────────────────────────────────

/// Map a bitrate target onto a zstd level: more bandwidth, faster
/// (lighter) compression.
pub fn level_for_bitrate(bitrate_bps: u64) -> i32 {
    match bitrate_bps {
        b if b >= 50_000_000 => 1,
        b if b >= 20_000_000 => 3,
        b if b >= 8_000_000 => 6,
        _ => 9,
    }
}

/// Software encoder for [`CodecType::Zstd`].
pub struct ZstdEncoder {
    params: EncoderParams,
    compression_level: i32,
    /// Last packed frame, the reference for the next delta.
    previous: Option<Vec<u8>>,
    force_keyframe: bool,
    frames_since_keyframe: u64,
    frame_count: u64,
}

impl ZstdEncoder {
    pub fn new(params: EncoderParams) -> Self {
        let compression_level = level_for_bitrate(params.bitrate_bps);
        Self {
            params,
            compression_level,
            previous: None,
            force_keyframe: true,
            frames_since_keyframe: 0,
            frame_count: 0,
        }
    }

    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    /// A keyframe at least every four seconds bounds how long a lost
    /// reference can go unnoticed.
    fn keyframe_interval(&self) -> u64 {
        self.params.fps.max(1) as u64 * 4
    }

    /// Emit all rows packed tightly (no padding).
    fn pack_rows(frame: &CapturedFrame, stride: u32, data: &[u8]) -> Option<Vec<u8>> {
        let row_len = frame.width as usize * 4;
        let stride = stride as usize;
        if stride < row_len || data.len() < stride * frame.height as usize {
            return None;
        }

        let mut out = Vec::with_capacity(row_len * frame.height as usize);
        for y in 0..frame.height as usize {
            let row_start = y * stride;
            out.extend_from_slice(&data[row_start..row_start + row_len]);
        }
        Some(out)
    }
}

impl Encoder for ZstdEncoder {
    fn backend(&self) -> BackendKind {
        BackendKind::Software
    }

    fn codec(&self) -> CodecType {
        CodecType::Zstd
    }

    fn encode(&mut self, frame: &CapturedFrame) -> Option<EncodedOutput> {
        let FrameData::Cpu { stride, data } = &frame.data else {
            warn!("software encoder received a GPU surface");
            return None;
        };
        let Some(packed) = Self::pack_rows(frame, *stride, data) else {
            warn!(
                width = frame.width,
                height = frame.height,
                "captured buffer smaller than its dimensions"
            );
            return None;
        };

        let keyframe = match &self.previous {
            Some(prev) => {
                self.force_keyframe
                    || prev.len() != packed.len()
                    || self.frames_since_keyframe >= self.keyframe_interval()
            }
            None => true,
        };

        let raw = match (&self.previous, keyframe) {
            (Some(prev), false) => prev.iter().zip(&packed).map(|(a, b)| a ^ b).collect(),
            _ => packed.clone(),
        };

        let compressed = match zstd::encode_all(raw.as_slice(), self.compression_level) {
            Ok(c) => c,
            Err(e) => {
                warn!("zstd encode failed: {e}");
                return None;
            }
        };

        self.previous = Some(packed);
        self.frame_count += 1;
        if keyframe {
            self.force_keyframe = false;
            self.frames_since_keyframe = 0;
        } else {
            self.frames_since_keyframe += 1;
        }

        Some(EncodedOutput {
            payload: Bytes::from(compressed),
            is_keyframe: keyframe,
        })
    }

    fn reconfigure(&mut self, request: &ReconfigureRequest) -> bool {
        if let Some(bitrate) = request.bitrate_bps {
            self.params.bitrate_bps = bitrate;
            self.compression_level = level_for_bitrate(bitrate);
        }
        if let Some(fps) = request.fps {
            self.params.fps = fps.max(1);
        }
        debug!(
            bitrate = self.params.bitrate_bps,
            fps = self.params.fps,
            level = self.compression_level,
            "zstd encoder reconfigured"
        );
        true
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn capture_format(&self) -> CaptureFormat {
        CaptureFormat {
            pixel: PixelFormat::Bgra8,
            cpu_readable: true,
        }
    }
}

// ── SoftwareEncoderFactory ───────────────────────────────────────

/// Factory for hosts without any hardware encoder: offers only the
/// software zstd codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareEncoderFactory;

impl EncoderFactory for SoftwareEncoderFactory {
    fn abilities(&self) -> Vec<EncodeAbility> {
        vec![EncodeAbility::new(CodecType::Zstd, BackendKind::Software)]
    }

    fn hardware_backends(&self) -> Vec<BackendKind> {
        Vec::new()
    }

    fn create_hard(&self, _backend: BackendKind, _params: &EncoderParams) -> Option<Box<dyn Encoder>> {
        None
    }

    fn create_soft(&self, params: &EncoderParams) -> Option<Box<dyn Encoder>> {
        match params.codec {
            CodecType::Zstd => Some(Box::new(ZstdEncoder::new(params.clone()))),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
