//! Host (sending) side: capture → encode.

pub mod bitrate;
pub mod cursor;
pub mod pipeline;
pub mod select;
pub mod throttle;

pub use bitrate::BitrateController;
pub use cursor::CursorCache;
pub use pipeline::{CaptureEncodePipeline, HostControl, HostEvent, HostEventReceiver, HostEventSender, HostParams};
pub use select::{SelectedEncoder, select_encoder};
pub use throttle::FpsThrottle;
