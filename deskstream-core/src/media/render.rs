//! Renderer and overlay collaborators, plus a headless renderer.
//!
//! The render thread of the client pipeline drives a [`Renderer`]: it
//! waits for swap-chain readiness, draws the newest decoded texture,
//! presents, then lets each [`Overlay`] composite on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::media::device::{BorrowedDevice, OwnedDevice};
use crate::media::types::{CursorState, MouseMode, PixelFormat, RenderOutcome, ResourceId};

// ── RenderStats ──────────────────────────────────────────────────

/// Per-pipeline statistics handed to overlays every rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderStats {
    /// Frames presented per second, averaged over the last second.
    pub fps: f32,
    pub decoded_frames: u64,
    /// Decoded frames the smoother replaced before they were shown.
    pub dropped_frames: u64,
    pub rendered_frames: u64,
    /// Capture → arrival, corrected by the host/client clock offset.
    pub latency_ms: f32,
    pub rtt_ms: u32,
    pub bwe_bps: u64,
    pub loss_rate: f32,
}

// ── Renderer contract ────────────────────────────────────────────

/// A presentation backend owning the client's GPU device.
pub trait Renderer: Send {
    /// The device the decoder borrows.
    fn device(&self) -> BorrowedDevice;

    /// Register the decoder's output textures. Called once before the
    /// render thread starts.
    fn bind_textures(&mut self, textures: &[ResourceId], format: PixelFormat) -> bool;

    /// Block until the swap chain can accept a frame, at most `timeout`.
    fn wait_for_pipeline(&mut self, timeout: Duration) -> bool;

    /// Draw `resource` into the back buffer.
    fn render(&mut self, resource: ResourceId) -> RenderOutcome;

    fn present(&mut self) -> RenderOutcome;

    fn update_cursor(&mut self, cursor: &CursorState);

    fn switch_mouse_mode(&mut self, mode: MouseMode);

    fn switch_stretch_mode(&mut self, stretch: bool);

    /// Recreate swap-chain resources after device loss.
    fn reset_render_target(&mut self) -> bool;
}

/// A widget composited after the video frame.
pub trait Overlay: Send {
    fn render(&mut self, stats: &RenderStats) -> RenderOutcome;

    /// Reinitialise after a [`RenderOutcome::Reset`].
    fn reset(&mut self) -> bool;
}

// ── HeadlessRenderer ─────────────────────────────────────────────

/// Counters a [`HeadlessRenderer`] exposes to its owner.
#[derive(Debug, Default)]
pub struct RenderCounters {
    pub rendered: AtomicU64,
    pub presented: AtomicU64,
    pub cursor_updates: AtomicU64,
    pub target_resets: AtomicU64,
    pub stretch: AtomicBool,
    pub last_cursor: Mutex<Option<CursorState>>,
}

impl RenderCounters {
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }
}

/// Renderer with no window: validates and counts draw calls, pacing
/// presentation to a virtual refresh rate.
pub struct HeadlessRenderer {
    device: OwnedDevice,
    bound: Vec<ResourceId>,
    format: Option<PixelFormat>,
    refresh_interval: Option<Duration>,
    next_vsync: Option<Instant>,
    mouse_mode: MouseMode,
    counters: Arc<RenderCounters>,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self {
            device: OwnedDevice::new("headless-render"),
            bound: Vec::new(),
            format: None,
            refresh_interval: None,
            next_vsync: None,
            mouse_mode: MouseMode::default(),
            counters: Arc::new(RenderCounters::default()),
        }
    }

    /// Pace `wait_for_pipeline` to a virtual display refresh.
    pub fn with_refresh_rate(mut self, hz: u32) -> Self {
        if hz > 0 {
            self.refresh_interval = Some(Duration::from_secs_f64(1.0 / hz as f64));
        }
        self
    }

    pub fn counters(&self) -> Arc<RenderCounters> {
        self.counters.clone()
    }

    pub fn mouse_mode(&self) -> MouseMode {
        self.mouse_mode
    }
}

impl Default for HeadlessRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for HeadlessRenderer {
    fn device(&self) -> BorrowedDevice {
        self.device.borrow()
    }

    fn bind_textures(&mut self, textures: &[ResourceId], format: PixelFormat) -> bool {
        if textures.is_empty() {
            warn!("no textures to bind");
            return false;
        }
        self.bound = textures.to_vec();
        self.format = Some(format);
        debug!(count = textures.len(), ?format, "textures bound");
        true
    }

    fn wait_for_pipeline(&mut self, timeout: Duration) -> bool {
        let Some(interval) = self.refresh_interval else {
            return true;
        };
        let now = Instant::now();
        let due = self.next_vsync.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }
        self.next_vsync = Some(Instant::now() + interval);
        true
    }

    fn render(&mut self, resource: ResourceId) -> RenderOutcome {
        if !self.bound.contains(&resource) {
            warn!(resource = resource.0, "render of an unbound texture");
            return RenderOutcome::Failed;
        }
        self.counters.rendered.fetch_add(1, Ordering::Relaxed);
        RenderOutcome::Success
    }

    fn present(&mut self) -> RenderOutcome {
        self.counters.presented.fetch_add(1, Ordering::Relaxed);
        RenderOutcome::Success
    }

    fn update_cursor(&mut self, cursor: &CursorState) {
        self.counters.cursor_updates.fetch_add(1, Ordering::Relaxed);
        *self.counters.last_cursor.lock() = Some(cursor.clone());
    }

    fn switch_mouse_mode(&mut self, mode: MouseMode) {
        self.mouse_mode = mode;
    }

    fn switch_stretch_mode(&mut self, stretch: bool) {
        self.counters.stretch.store(stretch, Ordering::Relaxed);
    }

    fn reset_render_target(&mut self) -> bool {
        self.counters.target_resets.fetch_add(1, Ordering::Relaxed);
        self.next_vsync = None;
        true
    }
}

// ── StatsOverlay ─────────────────────────────────────────────────

/// Overlay that reports [`RenderStats`] through the log instead of
/// drawing them.
pub struct StatsOverlay {
    period: Duration,
    last_report: Option<Instant>,
    resets: u64,
}

impl StatsOverlay {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_report: None,
            resets: 0,
        }
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}

impl Overlay for StatsOverlay {
    fn render(&mut self, stats: &RenderStats) -> RenderOutcome {
        let due = self
            .last_report
            .is_none_or(|at| at.elapsed() >= self.period);
        if due {
            info!(
                fps = format!("{:.1}", stats.fps),
                latency_ms = format!("{:.1}", stats.latency_ms),
                decoded = stats.decoded_frames,
                dropped = stats.dropped_frames,
                rtt_ms = stats.rtt_ms,
                bwe_kbps = stats.bwe_bps / 1000,
                "render stats"
            );
            self.last_report = Some(Instant::now());
        }
        RenderOutcome::Success
    }

    fn reset(&mut self) -> bool {
        self.resets += 1;
        self.last_report = None;
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────
