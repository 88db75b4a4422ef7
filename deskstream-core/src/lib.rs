//! # deskstream-core
//!
//! Adaptive real-time video pipeline for remote desktop streaming.
//!
//! This crate contains:
//! - **Host pipeline**: `CaptureEncodePipeline` (capture → throttle → encode),
//!   with hardware-first encoder selection and automatic bitrate control
//! - **Client pipeline**: `DecodeRenderPipeline` (decode → smooth → render)
//! - **Smoother**: `CtSmoother`, the single-slot latest-frame-wins handoff
//! - **Negotiation**: `negotiate` / `negotiate_params`
//! - **Media**: collaborator traits (`Capturer`, `Encoder`, `Decoder`,
//!   `Renderer`, `Overlay`) plus software and synthetic implementations
//! - **Protocol**: the bincode-serialised `Message` set
//! - **Error**: `StreamError`, a `thiserror` taxonomy of pipeline failures

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod media;
pub mod negotiate;
pub mod protocol;
pub mod smoother;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{Action, ClientEvent, ClientParams, DecodeRenderPipeline};
pub use config::{ClientTuning, HostTuning};
pub use error::StreamError;
pub use host::{CaptureEncodePipeline, HostControl, HostEvent, HostParams};
pub use negotiate::{negotiate, negotiate_params};
pub use protocol::Message;
pub use smoother::{CtSmoother, SmoothedFrame};
pub use state::PipelineState;
