//! Host-side capture → encode pipeline.
//!
//! One dedicated thread runs the send-side loop:
//!
//! 1. Drain control tasks queued by [`HostControl`].
//! 2. Re-query the display mode; a change ends the pipeline.
//! 3. Poll the cursor and emit `CursorInfo` on change.
//! 4. Capture, let the [`FpsThrottle`] decide, encode, emit.
//!
//! Everything leaves the pipeline as a [`HostEvent`] on one channel; the
//! owner forwards `Outbound` messages to the transport and reacts to
//! `Terminated`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::HostTuning;
use crate::error::StreamError;
use crate::host::bitrate::BitrateController;
use crate::host::cursor::CursorCache;
use crate::host::select::select_encoder;
use crate::host::throttle::FpsThrottle;
use crate::media::capture::Capturer;
use crate::media::encoder::{Encoder, EncoderFactory, EncoderParams};
use crate::media::types::{CodecType, DisplayMode, EncodeAbility, ReconfigureRequest, now_us};
use crate::protocol::{EncodedFrame, Message, ReconfigureEncoder, SendSideStat};
use crate::state::PipelineState;

// ── Events & parameters ──────────────────────────────────────────

/// Everything the host pipeline reports to its owner.
#[derive(Debug)]
pub enum HostEvent {
    /// A message for the client.
    Outbound(Message),
    /// The capture thread has exited and will produce nothing more.
    Terminated(StreamError),
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Construction parameters of a [`CaptureEncodePipeline`].
#[derive(Debug, Clone)]
pub struct HostParams {
    /// The negotiated display mode.
    pub mode: DisplayMode,
    /// Client codec preferences, most preferred first.
    pub codec_preferences: Vec<CodecType>,
    pub initial_bitrate_bps: u64,
    /// Ceiling for every bitrate the encoder is given.
    pub max_bitrate_bps: u64,
    pub tuning: HostTuning,
}

// ── HostControl ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum HostTask {
    RequestKeyframe,
    Reconfigure(ReconfigureEncoder),
    NetworkChanged(SendSideStat),
}

/// Tasks waiting for the capture thread. Closed once the thread has
/// exited; later tasks are dropped.
#[derive(Debug, Default)]
struct TaskQueue {
    tasks: Mutex<Vec<HostTask>>,
    closed: AtomicBool,
}

impl TaskQueue {
    fn push(&self, task: HostTask) {
        let mut tasks = self.tasks.lock();
        if self.closed.load(Ordering::SeqCst) {
            debug!(?task, "host pipeline stopped, task dropped");
            return;
        }
        tasks.push(task);
    }

    fn drain(&self) -> Vec<HostTask> {
        std::mem::take(&mut *self.tasks.lock())
    }

    fn close(&self) {
        let mut tasks = self.tasks.lock();
        self.closed.store(true, Ordering::SeqCst);
        tasks.clear();
    }
}

/// Cloneable inbound handle. Calls never block on the capture thread;
/// tasks are queued and executed at the start of the next iteration.
#[derive(Debug, Clone, Default)]
pub struct HostControl {
    queue: Arc<TaskQueue>,
}

impl HostControl {
    /// Also invalidates the cursor cache: a keyframe request may come
    /// from a freshly built client.
    pub fn request_keyframe(&self) {
        self.queue.push(HostTask::RequestKeyframe);
    }

    pub fn reconfigure(&self, msg: ReconfigureEncoder) {
        self.queue.push(HostTask::Reconfigure(msg));
    }

    pub fn network_changed(&self, stat: SendSideStat) {
        self.queue.push(HostTask::NetworkChanged(stat));
    }

    /// Route a client message. Returns `false` for messages the host
    /// pipeline does not consume.
    pub fn handle_message(&self, msg: Message) -> bool {
        match msg {
            Message::RequestKeyframe => self.request_keyframe(),
            Message::ReconfigureEncoder(r) => self.reconfigure(r),
            Message::SendSideStat(s) => self.network_changed(s),
            _ => return false,
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.queue.tasks.lock().len()
    }

    /// Whether the capture thread has gone and tasks are being dropped.
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::SeqCst)
    }
}

// ── CaptureEncodePipeline ────────────────────────────────────────

/// Owns one capturer and one encoder and the thread driving them.
pub struct CaptureEncodePipeline {
    worker: Option<CaptureWorker>,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    state: PipelineState,
    control: HostControl,
    ability: EncodeAbility,
    fps: u32,
    mode: DisplayMode,
    start_timeout: Duration,
    frames_encoded: Arc<AtomicU64>,
}

impl CaptureEncodePipeline {
    /// Validate parameters, select an encoder and configure the
    /// capturer for it. Nothing runs until [`start`](Self::start).
    pub fn create(
        params: HostParams,
        mut capturer: Box<dyn Capturer>,
        factory: &dyn EncoderFactory,
        events: HostEventSender,
    ) -> Result<Self, StreamError> {
        let mode = params.mode;
        if mode.width == 0 || mode.height == 0 || mode.refresh_rate == 0 {
            return Err(StreamError::InvalidParams("display mode must be non-zero"));
        }
        if params.codec_preferences.is_empty() {
            return Err(StreamError::InvalidParams("codec preference list is empty"));
        }
        if params.max_bitrate_bps == 0 {
            return Err(StreamError::InvalidParams("bitrate ceiling must be non-zero"));
        }

        let tuning = params.tuning;
        let initial_bps = params.initial_bitrate_bps.min(params.max_bitrate_bps);
        let base = EncoderParams {
            codec: params.codec_preferences[0],
            width: mode.width,
            height: mode.height,
            fps: mode.refresh_rate,
            bitrate_bps: initial_bps,
            device: capturer.device(),
        };
        let selected = select_encoder(
            factory,
            &params.codec_preferences,
            &base,
            tuning.soft_fps_ceiling,
        )?;
        capturer.set_capture_format(selected.encoder.capture_format())?;

        let running = Arc::new(AtomicBool::new(false));
        let control = HostControl::default();
        let frames_encoded = Arc::new(AtomicU64::new(0));

        let worker = CaptureWorker {
            capturer,
            encoder: selected.encoder,
            codec: selected.ability.codec,
            mode,
            throttle: FpsThrottle::new(selected.fps, tuning.throttle_hysteresis_fps),
            bitrate: BitrateController::new(initial_bps, params.max_bitrate_bps, selected.fps, &tuning),
            cursor: CursorCache::new(),
            tasks: control.queue.clone(),
            events,
            running: running.clone(),
            capture_timeout: tuning.capture_timeout(),
            picture_id: 0,
            frames_encoded: frames_encoded.clone(),
        };

        info!(
            %mode,
            codec = %selected.ability.codec,
            backend = %selected.ability.backend,
            fps = selected.fps,
            "host pipeline created"
        );

        Ok(Self {
            worker: Some(worker),
            thread: None,
            running,
            state: PipelineState::Created,
            control,
            ability: selected.ability,
            fps: selected.fps,
            mode,
            start_timeout: tuning.start_timeout(),
            frames_encoded,
        })
    }

    /// Spawn the capture thread and block until capture has begun.
    pub fn start(&mut self) -> Result<(), StreamError> {
        self.state.start()?;
        let worker = self
            .worker
            .take()
            .ok_or(StreamError::InvalidState("capture worker already consumed"))?;

        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        self.running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("capture-encode".into())
            .spawn(move || worker.run(ready_tx));
        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.state.stop();
                return Err(e.into());
            }
        };
        self.thread = Some(handle);

        let result = match ready_rx.recv_timeout(self.start_timeout) {
            Ok(r) => r,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(StreamError::Timeout(self.start_timeout)),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(StreamError::CaptureStart(
                "capture thread exited before reporting".into(),
            )),
        };
        if let Err(e) = result {
            error!("host pipeline failed to start: {e}");
            self.stop();
            return Err(e);
        }
        info!(mode = %self.mode, "host pipeline started");
        Ok(())
    }

    /// Stop the capture thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
        }
        self.worker = None;
        self.control.queue.close();
        if self.state.stop() {
            debug!("host pipeline stopped");
        }
    }

    /// Inbound handle for client messages.
    pub fn control(&self) -> HostControl {
        self.control.clone()
    }

    pub fn ability(&self) -> EncodeAbility {
        self.ability
    }

    /// Frame rate the encoder runs at.
    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Whether the capture thread is still looping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureEncodePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Capture thread ───────────────────────────────────────────────

struct CaptureWorker {
    capturer: Box<dyn Capturer>,
    encoder: Box<dyn Encoder>,
    codec: CodecType,
    mode: DisplayMode,
    throttle: FpsThrottle,
    bitrate: BitrateController,
    cursor: CursorCache,
    tasks: Arc<TaskQueue>,
    events: HostEventSender,
    running: Arc<AtomicBool>,
    capture_timeout: Duration,
    picture_id: u64,
    frames_encoded: Arc<AtomicU64>,
}

impl CaptureWorker {
    fn run(mut self, ready: std_mpsc::SyncSender<Result<(), StreamError>>) {
        if let Err(e) = self.capturer.start() {
            self.running.store(false, Ordering::SeqCst);
            self.tasks.close();
            let _ = ready.send(Err(e));
            return;
        }
        if ready.send(Ok(())).is_err() {
            self.running.store(false, Ordering::SeqCst);
            self.tasks.close();
            return;
        }

        while self.running.load(Ordering::SeqCst) {
            self.drain_tasks();

            let current = self.capturer.display_mode();
            if current != self.mode {
                self.on_mode_change(current);
                break;
            }

            if !self.poll_cursor() {
                break;
            }

            let Some(frame) = self.capturer.capture(self.capture_timeout) else {
                continue;
            };

            if frame.width != self.mode.width || frame.height != self.mode.height {
                // The mode check at the top of the next iteration handles it.
                self.capturer.done_with_frame(frame);
                continue;
            }

            let mut delivered = true;
            if self.throttle.should_encode_frame(frame.timestamp_us) {
                let start_ts = now_us();
                let output = self.encoder.encode(&frame);
                let end_ts = now_us();

                if let Some(out) = output {
                    let encoded = EncodedFrame {
                        codec: self.codec,
                        width: frame.width,
                        height: frame.height,
                        is_keyframe: out.is_keyframe,
                        picture_id: self.picture_id,
                        capture_ts_us: frame.timestamp_us,
                        start_encode_ts_us: start_ts,
                        end_encode_ts_us: end_ts,
                        payload: out.payload,
                    };
                    self.picture_id += 1;
                    self.frames_encoded.fetch_add(1, Ordering::Relaxed);
                    delivered = self.emit(HostEvent::Outbound(Message::EncodedFrame(encoded)));
                }
            }
            self.capturer.done_with_frame(frame);

            if !delivered {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.tasks.close();
        info!(frames = self.picture_id, "capture thread exiting");
    }

    fn emit(&self, event: HostEvent) -> bool {
        if self.events.send(event).is_err() {
            warn!("host event receiver dropped, stopping capture");
            return false;
        }
        true
    }

    fn drain_tasks(&mut self) {
        let tasks = self.tasks.drain();
        let mut keyframe = false;
        for task in tasks {
            match task {
                HostTask::RequestKeyframe => keyframe = true,
                HostTask::Reconfigure(msg) => {
                    if let Some(patch) = self.bitrate.handle_reconfigure(&msg) {
                        self.apply(patch);
                    }
                }
                HostTask::NetworkChanged(stat) => {
                    if let Some(patch) = self.bitrate.on_network_changed(&stat) {
                        self.apply(patch);
                    }
                }
            }
        }
        if keyframe {
            debug!(next_picture = self.picture_id, "keyframe requested");
            self.encoder.request_keyframe();
            self.cursor.invalidate();
        }
    }

    fn apply(&mut self, patch: ReconfigureRequest) {
        if let Some(fps) = patch.fps {
            self.throttle.set_target_fps(fps);
        }
        if !self.encoder.reconfigure(&patch) {
            warn!(?patch, "encoder rejected reconfigure");
        }
    }

    fn on_mode_change(&mut self, current: DisplayMode) {
        info!(from = %self.mode, to = %current, "display mode changed");
        if self.emit(HostEvent::Outbound(Message::ChangeStreamingParams(current.into()))) {
            self.emit(HostEvent::Terminated(StreamError::ResolutionChanged {
                width: current.width,
                height: current.height,
                refresh_rate: current.refresh_rate,
            }));
        }
    }

    /// Returns `false` once the owner has gone away.
    fn poll_cursor(&mut self) -> bool {
        let snapshot = self
            .capturer
            .cursor_compositor()
            .or_else(|| self.capturer.cursor_legacy());
        match snapshot.and_then(|s| self.cursor.update(s)) {
            Some(info) => self.emit(HostEvent::Outbound(Message::CursorInfo(info))),
            None => true,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
