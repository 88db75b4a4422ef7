//! Client (receiving) side: decode → render.

pub mod pipeline;
pub mod render_state;
pub mod telemetry;

pub use pipeline::{Action, ClientEvent, ClientEventReceiver, ClientEventSender, ClientParams, DecodeRenderPipeline};
pub use render_state::{CursorStore, RenderSlot, RenderWake};
pub use telemetry::{StatsTracker, Telemetry};
