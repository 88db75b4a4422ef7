//! Client-side decode → render pipeline.
//!
//! ```text
//! submit() ──► decode queue ──[decode thread]──► CtSmoother ──[render thread]──► Renderer
//!                 (FIFO)        5 ms waits         1 slot        16 ms waits      + overlays
//! ```
//!
//! Every method takes `&self`; the pipeline is meant to be shared in an
//! `Arc` between the transport (which submits frames and telemetry) and
//! the owner (which stops it). Failures the pipeline cannot absorb are
//! reported as [`ClientEvent`]s; the owner rebuilds the instance. The
//! pipeline never rebuilds itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::render_state::{RenderSlot, RenderWake};
use crate::client::telemetry::{StatsTracker, Telemetry};
use crate::config::ClientTuning;
use crate::error::StreamError;
use crate::media::decoder::Decoder;
use crate::media::device::{BorrowedDevice, GpuContextLock};
use crate::media::render::{Overlay, RenderStats, Renderer};
use crate::media::types::{
    DecodeStatus, MouseMode, NegotiatedParams, RenderOutcome, ResourceId, SurfaceHandle, now_us,
};
use crate::protocol::{CursorInfo, EncodedFrame, Message, ReconfigureEncoder};
use crate::smoother::SmoothedFrame;
use crate::state::PipelineState;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

// ── Events & parameters ──────────────────────────────────────────

/// Everything the client pipeline reports to its owner.
#[derive(Debug)]
pub enum ClientEvent {
    /// A message for the host.
    Outbound(Message),
    /// The decoder is in an unknown state; rebuild this instance.
    ResetRequested { instance: u64, cause: StreamError },
    /// The render thread has exited for good.
    RenderStopped { instance: u64, cause: StreamError },
}

pub type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;
pub type ClientEventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// What the caller of [`DecodeRenderPipeline::submit`] should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// A previous frame failed to decode; ask the host for a keyframe.
    RequestKeyFrame,
    None,
}

/// Construction parameters of a [`DecodeRenderPipeline`].
#[derive(Debug, Default)]
pub struct ClientParams {
    negotiated: Option<NegotiatedParams>,
    surface: Option<SurfaceHandle>,
    events: Option<ClientEventSender>,
    tuning: ClientTuning,
}

impl ClientParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn negotiated(mut self, params: NegotiatedParams) -> Self {
        self.negotiated = Some(params);
        self
    }

    /// The native surface the renderer presents into.
    pub fn surface(mut self, surface: SurfaceHandle) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn events(mut self, events: ClientEventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tuning(mut self, tuning: ClientTuning) -> Self {
        self.tuning = tuning;
        self
    }
}

// ── Shared state ─────────────────────────────────────────────────

struct QueuedFrame {
    frame: EncodedFrame,
    arrival_us: u64,
}

struct Shared {
    instance: u64,
    params: NegotiatedParams,
    tuning: ClientTuning,
    events: ClientEventSender,

    running: AtomicBool,
    /// Set once no more frames are accepted (stopped or decoder dead).
    closed: AtomicBool,
    keyframe_needed: AtomicBool,
    reset_target: AtomicBool,

    queue: Mutex<VecDeque<QueuedFrame>>,
    queue_cv: Condvar,

    render: Mutex<RenderSlot>,
    render_cv: Condvar,

    gpu: GpuContextLock,
    telemetry: Mutex<Telemetry>,
    stats: Mutex<StatsTracker>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!(instance = self.instance, "client event receiver dropped");
        }
    }

    fn wake_render(&self, reason: RenderWake) {
        self.render.lock().wake |= reason;
        self.render_cv.notify_one();
    }
}

type Parts = (Box<dyn Decoder>, Box<dyn Renderer>, Vec<Box<dyn Overlay>>);

// ── DecodeRenderPipeline ─────────────────────────────────────────

/// One decoder, one renderer, one smoother and the two threads driving
/// them.
pub struct DecodeRenderPipeline {
    shared: Arc<Shared>,
    state: Mutex<PipelineState>,
    parts: Mutex<Option<Parts>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DecodeRenderPipeline {
    /// Validate parameters and wire the decoder to the renderer's
    /// device. Nothing runs until [`start`](Self::start).
    pub fn create<F>(
        params: ClientParams,
        mut renderer: Box<dyn Renderer>,
        make_decoder: F,
        overlays: Vec<Box<dyn Overlay>>,
    ) -> Result<Self, StreamError>
    where
        F: FnOnce(BorrowedDevice, &NegotiatedParams) -> Option<Box<dyn Decoder>>,
    {
        let negotiated = params
            .negotiated
            .ok_or(StreamError::InvalidParams("negotiated parameters missing"))?;
        if negotiated.width == 0 || negotiated.height == 0 {
            return Err(StreamError::InvalidParams("negotiated size must be non-zero"));
        }
        if params.surface.is_none() {
            return Err(StreamError::InvalidParams("target surface missing"));
        }
        let events = params
            .events
            .ok_or(StreamError::InvalidParams("event sink missing"))?;

        let mut decoder = make_decoder(renderer.device(), &negotiated)
            .ok_or(StreamError::InvalidParams("no decoder for the negotiated codec"))?;

        let gpu = GpuContextLock::new();
        decoder.bind_context_lock(gpu.clone());
        if !renderer.bind_textures(&decoder.textures(), decoder.decoded_format()) {
            return Err(StreamError::InvalidParams("renderer rejected decoder textures"));
        }
        renderer.switch_stretch_mode(negotiated.stretch);

        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        info!(
            instance,
            codec = %negotiated.codec,
            mode = %negotiated.display_mode(),
            "client pipeline created"
        );

        let shared = Arc::new(Shared {
            instance,
            params: negotiated,
            tuning: params.tuning,
            events,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            keyframe_needed: AtomicBool::new(false),
            reset_target: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            render: Mutex::new(RenderSlot::new(negotiated.stretch)),
            render_cv: Condvar::new(),
            gpu,
            telemetry: Mutex::new(Telemetry::default()),
            stats: Mutex::new(StatsTracker::new()),
        });

        Ok(Self {
            shared,
            state: Mutex::new(PipelineState::Created),
            parts: Mutex::new(Some((decoder, renderer, overlays))),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the decode and render threads.
    pub fn start(&self) -> Result<(), StreamError> {
        self.state.lock().start()?;
        let (decoder, renderer, overlays) = self
            .parts
            .lock()
            .take()
            .ok_or(StreamError::InvalidState("pipeline parts already consumed"))?;

        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let decode = thread::Builder::new()
            .name("decode".into())
            .spawn(move || decode_loop(shared, decoder));
        let decode = match decode {
            Ok(h) => h,
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        };
        self.threads.lock().push(decode);

        let shared = self.shared.clone();
        let render = thread::Builder::new()
            .name("render".into())
            .spawn(move || render_loop(shared, renderer, overlays));
        match render {
            Ok(h) => self.threads.lock().push(h),
            Err(e) => {
                self.stop();
                return Err(e.into());
            }
        }

        info!(instance = self.shared.instance, "client pipeline started");
        Ok(())
    }

    /// Stop both threads and wait for them. Idempotent; a pipeline
    /// thread calling this never joins itself.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
        self.shared.render_cv.notify_all();

        let handles = std::mem::take(&mut *self.threads.lock());
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(instance = self.shared.instance, "pipeline thread panicked");
            }
        }

        self.shared.queue.lock().clear();
        self.parts.lock().take();
        if self.state.lock().stop() {
            debug!(instance = self.shared.instance, "client pipeline stopped");
        }
    }

    /// Queue a frame for decoding. Never blocks on decode or render.
    pub fn submit(&self, frame: EncodedFrame) -> Action {
        if self.shared.closed.load(Ordering::SeqCst) {
            debug!(picture_id = frame.picture_id, "frame dropped, pipeline closed");
        } else {
            let depth = {
                let mut queue = self.shared.queue.lock();
                queue.push_back(QueuedFrame {
                    frame,
                    arrival_us: now_us(),
                });
                queue.len()
            };
            self.shared.queue_cv.notify_one();
            if depth == self.shared.tuning.queue_warn_depth {
                warn!(depth, "decode queue backing up");
            }
        }

        if self.shared.keyframe_needed.swap(false, Ordering::SeqCst) {
            Action::RequestKeyFrame
        } else {
            Action::None
        }
    }

    // ── Telemetry ────────────────────────────────────────────────

    pub fn set_time_diff(&self, us: i64) {
        self.shared.telemetry.lock().set_time_diff(us);
    }

    pub fn set_rtt(&self, ms: u32) {
        self.shared.telemetry.lock().set_rtt(ms);
    }

    pub fn set_bwe(&self, bps: u64) {
        self.shared.telemetry.lock().set_bwe(bps);
    }

    /// Cumulative: `count` NACKs are added to those not yet reported in
    /// a `SendSideStat`.
    pub fn set_nack(&self, count: u32) {
        self.shared.telemetry.lock().add_nacks(count);
    }

    pub fn set_loss_rate(&self, rate: f32) {
        self.shared.telemetry.lock().set_loss_rate(rate);
    }

    /// Bitrate the current link should sustain, for a UI to offer.
    pub fn suggested_bitrate_bps(&self, cap_bps: u64) -> Option<u64> {
        self.shared.telemetry.lock().suggested_bitrate_bps(cap_bps)
    }

    /// Pin the host encoder to `bps`, disabling automatic control.
    pub fn request_bitrate(&self, bps: u64) -> Result<(), StreamError> {
        self.shared
            .events
            .send(ClientEvent::Outbound(Message::ReconfigureEncoder(
                ReconfigureEncoder::manual(bps),
            )))?;
        Ok(())
    }

    /// Hand bitrate control back to the host.
    pub fn enable_auto_bitrate(&self) -> Result<(), StreamError> {
        self.shared
            .events
            .send(ClientEvent::Outbound(Message::ReconfigureEncoder(
                ReconfigureEncoder::turn_on_auto(),
            )))?;
        Ok(())
    }

    // ── Render state ─────────────────────────────────────────────

    /// The GPU device was lost; recreate the render target.
    pub fn reset_render_target(&self) {
        self.shared.reset_target.store(true, Ordering::SeqCst);
        self.shared.render_cv.notify_one();
    }

    pub fn set_cursor_info(&self, info: CursorInfo) {
        let mut slot = self.shared.render.lock();
        if let Some(state) = slot.cursors.resolve(info) {
            slot.cursor = Some(state);
            slot.wake |= RenderWake::CURSOR;
            drop(slot);
            self.shared.render_cv.notify_one();
        }
    }

    pub fn switch_mouse_mode(&self, mode: MouseMode) {
        let mut slot = self.shared.render.lock();
        slot.mouse_mode = mode;
        slot.wake |= RenderWake::MOUSE_MODE;
        drop(slot);
        self.shared.render_cv.notify_one();
    }

    pub fn switch_stretch_mode(&self, stretch: bool) {
        let mut slot = self.shared.render.lock();
        slot.stretch = stretch;
        slot.wake |= RenderWake::STRETCH;
        drop(slot);
        self.shared.render_cv.notify_one();
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    pub fn params(&self) -> NegotiatedParams {
        self.shared.params
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn stats(&self) -> RenderStats {
        let dropped = self.shared.render.lock().smoother.dropped();
        let telemetry = self.shared.telemetry.lock().clone();
        self.shared.stats.lock().snapshot(dropped, &telemetry)
    }

    /// Frames waiting in the smoother (0 or 1).
    pub fn smoother_size(&self) -> usize {
        self.shared.render.lock().smoother.size()
    }
}

impl Drop for DecodeRenderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Decode thread ────────────────────────────────────────────────

fn decode_loop(shared: Arc<Shared>, mut decoder: Box<dyn Decoder>) {
    let wait = shared.tuning.decode_wait();

    while shared.running.load(Ordering::SeqCst) {
        let next = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                shared.queue_cv.wait_for(&mut queue, wait);
            }
            queue.pop_front()
        };
        let Some(item) = next else {
            continue;
        };

        let decoded = {
            let _gpu = shared.gpu.lock();
            decoder.decode(&item.frame)
        };

        match (decoded.status, decoded.resource) {
            (DecodeStatus::Ok, Some(resource)) => {
                shared.stats.lock().record_decoded();
                shared.render.lock().smoother.push(SmoothedFrame {
                    resource,
                    capture_ts_us: item.frame.capture_ts_us,
                    arrival_ts_us: item.arrival_us,
                });
                shared.wake_render(RenderWake::FRAME);
            }
            (DecodeStatus::Ok, None) => {
                warn!(picture_id = item.frame.picture_id, "decoder returned Ok without a resource");
            }
            (DecodeStatus::Failed, _) => {
                let cause = StreamError::DecodeFailure {
                    picture_id: item.frame.picture_id,
                };
                debug!(instance = shared.instance, "{cause}, keyframe needed");
                shared.keyframe_needed.store(true, Ordering::SeqCst);
            }
            (status @ (DecodeStatus::EAgain | DecodeStatus::NeedReset), _) => {
                warn!(
                    instance = shared.instance,
                    picture_id = item.frame.picture_id,
                    ?status,
                    "decoder needs a rebuild"
                );
                shared.closed.store(true, Ordering::SeqCst);
                shared.queue.lock().clear();
                shared.emit(ClientEvent::ResetRequested {
                    instance: shared.instance,
                    cause: StreamError::DecodeFatal { status },
                });
                break;
            }
        }
    }

    debug!(instance = shared.instance, "decode thread exiting");
}

// ── Render thread ────────────────────────────────────────────────

fn render_loop(
    shared: Arc<Shared>,
    mut renderer: Box<dyn Renderer>,
    mut overlays: Vec<Box<dyn Overlay>>,
) {
    let wait = shared.tuning.render_wait();
    let stat_interval = shared.tuning.stat_interval();
    let mut last: Option<ResourceId> = None;
    let mut last_stat = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        if shared.reset_target.swap(false, Ordering::SeqCst) {
            let ok = {
                let _gpu = shared.gpu.lock();
                renderer.reset_render_target()
            };
            if !ok {
                render_stopped(&shared, StreamError::RenderDeviceLost);
                break;
            }
            info!(instance = shared.instance, "render target recreated");
        }

        if !renderer.wait_for_pipeline(wait) {
            continue;
        }

        let (frame, wake, cursor, mouse_mode, stretch) = {
            let mut slot = shared.render.lock();
            if slot.wake.is_empty() {
                shared.render_cv.wait_for(&mut slot, wait);
            }
            let wake = slot.take_wake();
            let frame = match slot.smoother.get(now_us()) {
                Some(_) => slot.smoother.pop(),
                None => None,
            };
            let cursor = if wake.contains(RenderWake::CURSOR) {
                slot.cursor.clone()
            } else {
                None
            };
            (frame, wake, cursor, slot.mouse_mode, slot.stretch)
        };
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(cursor) = &cursor {
            renderer.update_cursor(cursor);
        }
        if wake.contains(RenderWake::MOUSE_MODE) {
            renderer.switch_mouse_mode(mouse_mode);
        }
        if wake.contains(RenderWake::STRETCH) {
            renderer.switch_stretch_mode(stretch);
        }

        // Keep showing the last frame when nothing new was decoded.
        let Some(resource) = frame.map(|f| f.resource).or(last) else {
            continue;
        };

        let outcome = {
            let _gpu = shared.gpu.lock();
            match renderer.render(resource) {
                RenderOutcome::Success => renderer.present(),
                other => other,
            }
        };
        match outcome {
            RenderOutcome::Success => {}
            RenderOutcome::Reset => {
                reset_overlays(&mut overlays);
                continue;
            }
            RenderOutcome::Failed => {
                render_stopped(&shared, StreamError::RenderFatal);
                break;
            }
        }
        last = Some(resource);

        let telemetry = shared.telemetry.lock().clone();
        let snapshot = {
            let mut stats = shared.stats.lock();
            if let Some(f) = frame {
                stats.record_latency(f.capture_ts_us, f.arrival_ts_us, telemetry.time_diff_us);
            }
            stats.record_present(Instant::now());
            let dropped = shared.render.lock().smoother.dropped();
            stats.snapshot(dropped, &telemetry)
        };

        for overlay in overlays.iter_mut() {
            match overlay.render(&snapshot) {
                RenderOutcome::Success => {}
                RenderOutcome::Reset => {
                    if !overlay.reset() {
                        warn!("overlay failed to reinitialise");
                    }
                }
                RenderOutcome::Failed => warn!("overlay render failed"),
            }
        }

        if last_stat.elapsed() >= stat_interval {
            last_stat = Instant::now();
            let stat = shared.telemetry.lock().take_send_side_stat();
            if let Some(stat) = stat {
                shared.emit(ClientEvent::Outbound(Message::SendSideStat(stat)));
            }
        }
    }

    debug!(instance = shared.instance, "render thread exiting");
}

fn reset_overlays(overlays: &mut [Box<dyn Overlay>]) {
    for overlay in overlays.iter_mut() {
        if !overlay.reset() {
            warn!("overlay failed to reinitialise");
        }
    }
}

fn render_stopped(shared: &Shared, cause: StreamError) {
    error!(instance = shared.instance, "render thread stopping: {cause}");
    shared.emit(ClientEvent::RenderStopped {
        instance: shared.instance,
        cause,
    });
}

// ── Tests ────────────────────────────────────────────────────────
