//! Decoder collaborator and the software zstd decoder.
//!
//! Decoders turn [`EncodedFrame`]s into renderer-consumable textures.
//! They only ever borrow the renderer's device and report problems as a
//! [`DecodeStatus`](crate::media::DecodeStatus) rather than an error:
//! the client pipeline decides whether a status means "ask for a
//! keyframe" or "rebuild everything".

use tracing::debug;

use crate::media::device::{BorrowedDevice, GpuContextLock};
use crate::media::types::{CodecType, DecodedFrame, PixelFormat, ResourceId};
use crate::protocol::EncodedFrame;

// ── Decoder contract ─────────────────────────────────────────────

/// A video decoder bound to one negotiated codec.
pub trait Decoder: Send {
    /// Decode one frame. Called in submission order from the decode
    /// thread while the pipeline's GPU context lock is held.
    fn decode(&mut self, frame: &EncodedFrame) -> DecodedFrame;

    /// Output textures, bound to the renderer once at start.
    fn textures(&self) -> Vec<ResourceId>;

    fn decoded_format(&self) -> PixelFormat;

    /// Hook the decoder library's own locking to the pipeline's
    /// context lock. Decoders with no internal GPU access ignore it.
    fn bind_context_lock(&mut self, _lock: GpuContextLock) {}
}

// ── ZstdDecoder ──────────────────────────────────────────────────

/// Decoded pictures rotate through this many textures.
const TEXTURE_RING: usize = 3;

/// Software decoder for [`CodecType::Zstd`].
///
/// Keeps the last reconstructed picture as the reference for deltas.
/// Anything that leaves the reference unusable reports
/// [`Failed`](crate::media::DecodeStatus::Failed) and drops the
/// reference, so decoding only resumes at the next keyframe.
pub struct ZstdDecoder {
    device: BorrowedDevice,
    width: u32,
    height: u32,
    reference: Option<Vec<u8>>,
    textures: Vec<Vec<u8>>,
    next_texture: usize,
    context_lock: Option<GpuContextLock>,
    decoded: u64,
    failures: u64,
}

impl ZstdDecoder {
    pub fn new(device: BorrowedDevice, width: u32, height: u32) -> Self {
        Self {
            device,
            width,
            height,
            reference: None,
            textures: vec![Vec::new(); TEXTURE_RING],
            next_texture: 0,
            context_lock: None,
            decoded: 0,
            failures: 0,
        }
    }

    pub fn device(&self) -> BorrowedDevice {
        self.device
    }

    /// Pixels last written to `id`, tightly packed BGRA.
    pub fn texture_data(&self, id: ResourceId) -> Option<&[u8]> {
        self.textures.get(id.0 as usize).map(Vec::as_slice)
    }

    pub fn decoded_count(&self) -> u64 {
        self.decoded
    }

    pub fn failure_count(&self) -> u64 {
        self.failures
    }

    pub fn has_context_lock(&self) -> bool {
        self.context_lock.is_some()
    }

    fn fail(&mut self, picture_id: u64, reason: &str) -> DecodedFrame {
        debug!(picture_id, reason, "zstd decode failed");
        self.reference = None;
        self.failures += 1;
        DecodedFrame::failed()
    }

    /// Rebuild the full picture from a decompressed payload.
    fn reconstruct(&mut self, frame: &EncodedFrame, raw: Vec<u8>) -> Result<(), &'static str> {
        let expected = PixelFormat::Bgra8.frame_len(self.width, self.height);
        if frame.width != self.width || frame.height != self.height {
            return Err("frame size differs from negotiated size");
        }
        if raw.len() != expected {
            return Err("payload size mismatch");
        }

        if frame.is_keyframe {
            self.reference = Some(raw);
            return Ok(());
        }

        let reference = self.reference.as_mut().ok_or("delta without reference")?;
        for (px, delta) in reference.iter_mut().zip(&raw) {
            *px ^= delta;
        }
        Ok(())
    }
}

impl Decoder for ZstdDecoder {
    fn decode(&mut self, frame: &EncodedFrame) -> DecodedFrame {
        if frame.codec != CodecType::Zstd {
            return self.fail(frame.picture_id, "codec mismatch");
        }

        let raw = match zstd::decode_all(frame.payload.as_ref()) {
            Ok(raw) => raw,
            Err(_) => return self.fail(frame.picture_id, "corrupt zstd payload"),
        };
        if let Err(reason) = self.reconstruct(frame, raw) {
            return self.fail(frame.picture_id, reason);
        }

        let slot = self.next_texture;
        self.next_texture = (slot + 1) % TEXTURE_RING;
        if let Some(reference) = &self.reference {
            let texture = &mut self.textures[slot];
            texture.clear();
            texture.extend_from_slice(reference);
        }
        self.decoded += 1;
        DecodedFrame::ok(ResourceId(slot as u32))
    }

    fn textures(&self) -> Vec<ResourceId> {
        (0..TEXTURE_RING as u32).map(ResourceId).collect()
    }

    fn decoded_format(&self) -> PixelFormat {
        PixelFormat::Bgra8
    }

    fn bind_context_lock(&mut self, lock: GpuContextLock) {
        self.context_lock = Some(lock);
    }
}

// ── Tests ────────────────────────────────────────────────────────
