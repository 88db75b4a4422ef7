//! Wire protocol between host and client pipelines.
//!
//! # Messages
//!
//! ```text
//! Host   ──[EncodedFrame]──────────────────► Client   (continuous)
//! Host   ──[CursorInfo]────────────────────► Client   (on change)
//! Host   ──[ChangeStreamingParams]─────────► Client   (display mode changed)
//! Client ──[ChangeStreamingParamsAck]──────► Host
//!
//! Client ──[RequestKeyframe]───────────────► Host     (after a decode failure)
//! Client ──[ReconfigureEncoder]────────────► Host     (manual / auto bitrate)
//! Client ──[SendSideStat]──────────────────► Host     (periodic telemetry)
//! ```
//!
//! Every message is a variant of [`Message`] and serialises with
//! bincode. Framing and the transport itself belong to the layer that
//! owns the pipelines.

pub mod stream;

pub use stream::{
    CURSOR_CACHE_ENTRIES, ChangeStreamingParams, CursorBitmap, CursorInfo, CursorShape, EncodedFrame, Message,
    ReconfigureEncoder, ReconfigureTrigger, SendSideStat,
};
