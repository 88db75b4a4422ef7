//! Media types and the collaborator traits the pipelines drive.
//!
//! | Module    | Purpose                                              |
//! |-----------|------------------------------------------------------|
//! | `types`   | Frames, codecs, backends, display modes              |
//! | `device`  | Owned / borrowed GPU devices, shared context lock    |
//! | `capture` | `Capturer` trait + synthetic `PatternCapturer`       |
//! | `encoder` | `Encoder` / `EncoderFactory` + software zstd encoder |
//! | `decoder` | `Decoder` trait + software zstd decoder              |
//! | `render`  | `Renderer` / `Overlay` + headless implementations    |

pub mod capture;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod render;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use capture::{Capturer, PatternCapturer};
pub use decoder::{Decoder, ZstdDecoder};
pub use device::{BorrowedDevice, GpuContextLock, OwnedDevice};
pub use encoder::{EncodedOutput, Encoder, EncoderFactory, EncoderParams, SoftwareEncoderFactory, ZstdEncoder};
pub use render::{HeadlessRenderer, Overlay, RenderCounters, RenderStats, Renderer, StatsOverlay};
pub use types::*;
