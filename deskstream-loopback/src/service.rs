//! Loopback session: the owner of one host and one client pipeline.
//!
//! ```text
//! CaptureEncodePipeline ─HostEvent──► to_bytes ─link─► from_bytes ─► DecodeRenderPipeline
//!          ▲                                                                 │
//!          └─HostControl ◄─ from_bytes ◄─link─ to_bytes ◄──ClientEvent───────┘
//! ```
//!
//! Every message crosses the link in its wire form. The session reacts
//! to what the pipelines report: keyframe requests go back to the host,
//! a client reset rebuilds the client pipeline, and a display-mode
//! change tears both down and renegotiates once the client has
//! acknowledged the new mode (or the acknowledgement times out).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, interval, sleep_until};
use tracing::{debug, error, info, warn};

use deskstream_core::client::{ClientEventReceiver, ClientEventSender};
use deskstream_core::host::HostEventReceiver;
use deskstream_core::media::{
    BorrowedDevice, CodecType, Decoder, DisplayMode, EncoderFactory, HeadlessRenderer,
    NegotiatedParams, Overlay, PatternCapturer, RenderStats, SoftwareEncoderFactory, StatsOverlay,
    ZstdDecoder,
};
use deskstream_core::protocol::ChangeStreamingParams;
use deskstream_core::{
    Action, CaptureEncodePipeline, ClientEvent, DecodeRenderPipeline, HostControl, HostEvent,
    Message, StreamError, negotiate_params,
};

use crate::config::{LoopbackConfig, ModeChange};
use crate::link::LinkModel;

/// How often the session checks its stop flag.
const STOP_POLL: Duration = Duration::from_millis(50);

// ── Summary ──────────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The configured duration elapsed.
    Elapsed,
    /// The stop handle was cleared.
    Stopped,
    /// The client renderer failed for good.
    RenderStopped(StreamError),
    /// The host pipeline exited for a reason other than a mode change.
    HostTerminated(StreamError),
}

/// What happened during one [`LoopbackSession::run`].
#[derive(Debug)]
pub struct SessionSummary {
    pub codec: Option<CodecType>,
    pub final_mode: DisplayMode,
    pub frames_encoded: u64,
    /// Encoded frames handed to a client pipeline.
    pub frames_delivered: u64,
    pub bytes_on_wire: u64,
    pub keyframe_requests: u64,
    pub client_resets: u64,
    pub renegotiations: u64,
    /// Renegotiations that had to proceed without an acknowledgement.
    pub hard_restarts: u64,
    /// Statistics of the last client pipeline.
    pub stats: RenderStats,
    pub end: SessionEnd,
}

impl SessionSummary {
    fn new(mode: DisplayMode) -> Self {
        Self {
            codec: None,
            final_mode: mode,
            frames_encoded: 0,
            frames_delivered: 0,
            bytes_on_wire: 0,
            keyframe_requests: 0,
            client_resets: 0,
            renegotiations: 0,
            hard_restarts: 0,
            stats: RenderStats::default(),
            end: SessionEnd::Stopped,
        }
    }
}

// ── Renegotiation ────────────────────────────────────────────────

/// A display-mode switch waiting for both the host pipeline to exit
/// and the client to acknowledge the proposed mode.
#[derive(Debug, Clone, Copy)]
pub struct Renegotiation {
    proposed: ChangeStreamingParams,
    deadline: Instant,
    acked: bool,
    host_done: bool,
}

impl Renegotiation {
    pub fn new(proposed: ChangeStreamingParams, ack_timeout: Duration) -> Self {
        Self {
            proposed,
            deadline: Instant::now() + ack_timeout,
            acked: false,
            host_done: false,
        }
    }

    /// Record an acknowledgement. Returns `false` if it was for some
    /// other mode.
    pub fn on_ack(&mut self, params: ChangeStreamingParams) -> bool {
        let matched = params == self.proposed;
        self.acked |= matched;
        matched
    }

    pub fn on_host_terminated(&mut self) {
        self.host_done = true;
    }

    pub fn is_complete(&self) -> bool {
        self.acked && self.host_done
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_complete() && now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn target(&self) -> DisplayMode {
        self.proposed.into()
    }
}

// ── LoopbackSession ──────────────────────────────────────────────

enum GenerationEnd {
    Renegotiate { mode: DisplayMode, acked: bool },
    Finished(SessionEnd),
}

type Step = Result<Option<GenerationEnd>, StreamError>;

/// Runs a host and a client pipeline back to back in one process.
pub struct LoopbackSession {
    config: LoopbackConfig,
    running: Arc<AtomicBool>,
}

impl LoopbackSession {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clearing the returned flag ends the session.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stream until the duration elapses, the session is stopped or a
    /// pipeline fails for good.
    pub async fn run(&self) -> Result<SessionSummary, StreamError> {
        self.running.store(true, Ordering::SeqCst);

        let deadline = self.config.duration().map(|d| Instant::now() + d);
        let mut scripted: VecDeque<ModeChange> =
            self.config.session.mode_changes.iter().copied().collect();
        let mut mode = self.config.display_mode();
        let mut link = LinkModel::new(&self.config.link);
        let mut summary = SessionSummary::new(mode);

        let result = loop {
            if !self.is_running() {
                summary.end = SessionEnd::Stopped;
                break Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                summary.end = SessionEnd::Elapsed;
                break Ok(());
            }

            let change = scripted.pop_front();
            match self
                .run_generation(mode, change, deadline, &mut link, &mut summary)
                .await
            {
                Ok(GenerationEnd::Renegotiate { mode: next, acked }) => {
                    summary.renegotiations += 1;
                    if acked {
                        info!(from = %mode, to = %next, "renegotiating display mode");
                    } else {
                        warn!(from = %mode, to = %next, "mode change not acknowledged, hard restart");
                        summary.hard_restarts += 1;
                        link.reset();
                    }
                    mode = next;
                }
                Ok(GenerationEnd::Finished(end)) => {
                    summary.end = end;
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.running.store(false, Ordering::SeqCst);
        summary.bytes_on_wire = link.bytes_sent();
        result.map(|()| summary)
    }

    /// One host/client pipeline pair, from negotiation to teardown.
    async fn run_generation(
        &self,
        mode: DisplayMode,
        change: Option<ModeChange>,
        deadline: Option<Instant>,
        link: &mut LinkModel,
        summary: &mut SessionSummary,
    ) -> Result<GenerationEnd, StreamError> {
        let factory = SoftwareEncoderFactory;
        let negotiated = negotiate_params(
            mode,
            &factory.abilities(),
            &self.config.codec.preferences,
            self.config.codec.stretch,
        )?;
        summary.codec = Some(negotiated.codec);
        summary.final_mode = mode;

        let mut capturer = PatternCapturer::new(mode);
        if let Some(change) = change {
            capturer = capturer.with_mode_change(change.after_frames, change.mode());
        }

        let (host_tx, mut host_rx): (_, HostEventReceiver) = mpsc::unbounded_channel();
        let host = CaptureEncodePipeline::create(
            self.config.to_host_params(mode, negotiated.codec),
            Box::new(capturer),
            &factory,
            host_tx,
        )?;
        let host = start_host(host).await?;

        let (client_tx, mut client_rx): (_, ClientEventReceiver) = mpsc::unbounded_channel();
        let client = match start_client(&self.config, negotiated, client_tx.clone()) {
            Ok(client) => client,
            Err(e) => {
                stop_host(host).await;
                return Err(e);
            }
        };

        let (to_client, mut from_host) = mpsc::unbounded_channel::<Vec<u8>>();
        let (to_host, mut from_client) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut generation = Generation {
            config: &self.config,
            negotiated,
            control: host.control(),
            client,
            client_tx,
            to_client,
            to_host,
            renegotiation: None,
        };

        let mut telemetry = interval(self.config.link.telemetry_interval());
        let mut stop_poll = interval(STOP_POLL);

        if let Some(bps) = self.config.host.manual_bitrate_bps {
            if let Err(e) = generation.client.request_bitrate(bps) {
                warn!("manual bitrate request failed: {e}");
            }
        }

        let outcome = loop {
            let ack_deadline = generation.renegotiation.as_ref().map(Renegotiation::deadline);
            let step = tokio::select! {
                _ = sleep_until_opt(deadline) => Ok(Some(GenerationEnd::Finished(SessionEnd::Elapsed))),
                _ = stop_poll.tick() => {
                    if self.is_running() {
                        Ok(None)
                    } else {
                        Ok(Some(GenerationEnd::Finished(SessionEnd::Stopped)))
                    }
                }
                _ = sleep_until_opt(ack_deadline) => Ok(generation.ack_timed_out()),
                Some(event) = host_rx.recv() => generation.on_host_event(event, link),
                Some(bytes) = from_host.recv() => generation.deliver_to_client(&bytes, link, summary).await,
                Some(bytes) = from_client.recv() => generation.deliver_to_host(&bytes),
                Some(event) = client_rx.recv() => generation.on_client_event(event, link, summary).await,
                _ = telemetry.tick() => generation.feed_telemetry(link),
            };
            match step {
                Ok(None) => {}
                Ok(Some(end)) => break Ok(end),
                Err(e) => break Err(e),
            }
        };

        summary.stats = generation.client.stats();
        summary.frames_encoded += host.frames_encoded();
        stop_client(generation.client.clone()).await;
        stop_host(host).await;
        outcome
    }
}

// ── Generation ───────────────────────────────────────────────────

/// State of one pipeline pair while it streams.
struct Generation<'a> {
    config: &'a LoopbackConfig,
    negotiated: NegotiatedParams,
    control: HostControl,
    client: Arc<DecodeRenderPipeline>,
    client_tx: ClientEventSender,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    to_host: mpsc::UnboundedSender<Vec<u8>>,
    renegotiation: Option<Renegotiation>,
}

impl Generation<'_> {
    // ── Host side ────────────────────────────────────────────────

    fn on_host_event(&mut self, event: HostEvent, link: &mut LinkModel) -> Step {
        match event {
            HostEvent::Outbound(msg) => {
                match &msg {
                    Message::EncodedFrame(_) => {}
                    Message::ChangeStreamingParams(params) => {
                        self.renegotiation = Some(Renegotiation::new(*params, self.config.ack_timeout()));
                    }
                    other => debug!(kind = other.kind(), "host → client"),
                }
                transmit(&self.to_client, &msg, link)?;
                Ok(None)
            }
            HostEvent::Terminated(StreamError::ResolutionChanged {
                width,
                height,
                refresh_rate,
            }) => {
                let timeout = self.config.ack_timeout();
                self.renegotiation
                    .get_or_insert_with(|| {
                        Renegotiation::new(DisplayMode::new(width, height, refresh_rate).into(), timeout)
                    })
                    .on_host_terminated();
                Ok(self.take_completed())
            }
            HostEvent::Terminated(e) => {
                error!("host pipeline terminated: {e}");
                Ok(Some(GenerationEnd::Finished(SessionEnd::HostTerminated(e))))
            }
        }
    }

    /// A message arriving at the host end of the link.
    fn deliver_to_host(&mut self, bytes: &[u8]) -> Step {
        match Message::from_bytes(bytes)? {
            Message::ChangeStreamingParamsAck(params) => {
                match self.renegotiation.as_mut().map(|r| r.on_ack(params)) {
                    Some(true) => debug!(?params, "mode change acknowledged"),
                    _ => warn!(?params, "unexpected mode acknowledgement"),
                }
                Ok(self.take_completed())
            }
            msg => {
                let kind = msg.kind();
                if !self.control.handle_message(msg) {
                    warn!(kind, "message not consumed by host");
                }
                Ok(None)
            }
        }
    }

    fn take_completed(&mut self) -> Option<GenerationEnd> {
        if !self.renegotiation.as_ref().is_some_and(Renegotiation::is_complete) {
            return None;
        }
        let done = self.renegotiation.take()?;
        Some(GenerationEnd::Renegotiate {
            mode: done.target(),
            acked: true,
        })
    }

    fn ack_timed_out(&mut self) -> Option<GenerationEnd> {
        let pending = self.renegotiation.take_if(|r| r.is_expired(Instant::now()))?;
        Some(GenerationEnd::Renegotiate {
            mode: pending.target(),
            acked: false,
        })
    }

    // ── Client side ──────────────────────────────────────────────

    /// A message arriving at the client end of the link.
    async fn deliver_to_client(&mut self, bytes: &[u8], link: &mut LinkModel, summary: &mut SessionSummary) -> Step {
        match Message::from_bytes(bytes)? {
            Message::EncodedFrame(frame) => {
                summary.frames_delivered += 1;
                if self.client.submit(frame) == Action::RequestKeyFrame {
                    summary.keyframe_requests += 1;
                    transmit(&self.to_host, &Message::RequestKeyframe, link)?;
                }
            }
            Message::CursorInfo(info) => self.client.set_cursor_info(info),
            Message::ChangeStreamingParams(params) => {
                // The client pipeline is bound to the old size.
                stop_client(self.client.clone()).await;
                transmit(&self.to_host, &Message::ChangeStreamingParamsAck(params), link)?;
            }
            other => warn!(kind = other.kind(), "message not consumed by client"),
        }
        Ok(None)
    }

    async fn on_client_event(&mut self, event: ClientEvent, link: &mut LinkModel, summary: &mut SessionSummary) -> Step {
        match event {
            ClientEvent::Outbound(msg) => transmit(&self.to_host, &msg, link)?,
            ClientEvent::ResetRequested { instance, cause } => {
                if instance != self.client.instance() {
                    debug!(instance, "ignoring reset from a replaced client pipeline");
                    return Ok(None);
                }
                warn!(instance, "client pipeline reset: {cause}");
                self.rebuild_client(link, summary).await?;
            }
            ClientEvent::RenderStopped { instance, cause } => {
                if instance != self.client.instance() {
                    debug!(instance, "ignoring render stop from a replaced client pipeline");
                    return Ok(None);
                }
                if cause.requires_rebuild() {
                    warn!(instance, "render target lost, rebuilding client: {cause}");
                    self.rebuild_client(link, summary).await?;
                    return Ok(None);
                }
                error!(instance, "render stopped: {cause}");
                return Ok(Some(GenerationEnd::Finished(SessionEnd::RenderStopped(cause))));
            }
        }
        Ok(None)
    }

    /// Replace the client pipeline and ask the host for a keyframe the
    /// new decoder can start from.
    async fn rebuild_client(&mut self, link: &mut LinkModel, summary: &mut SessionSummary) -> Result<(), StreamError> {
        summary.client_resets += 1;
        stop_client(self.client.clone()).await;
        self.client = start_client(self.config, self.negotiated, self.client_tx.clone())?;
        transmit(&self.to_host, &Message::RequestKeyframe, link)
    }

    fn feed_telemetry(&mut self, link: &mut LinkModel) -> Step {
        let report = link.report();
        self.client.set_bwe(report.bwe_bps);
        self.client.set_rtt(report.rtt_ms);
        self.client.set_loss_rate(report.loss_rate);
        if report.nack > 0 {
            self.client.set_nack(report.nack);
        }
        Ok(None)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Serialise, meter and send one message.
fn transmit(
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    msg: &Message,
    link: &mut LinkModel,
) -> Result<(), StreamError> {
    let bytes = msg.to_bytes()?;
    link.transmit(bytes.len() as u64);
    tx.send(bytes).map_err(|_| StreamError::ChannelClosed)
}

fn make_decoder(device: BorrowedDevice, params: &NegotiatedParams) -> Option<Box<dyn Decoder>> {
    match params.codec {
        CodecType::Zstd => Some(Box::new(ZstdDecoder::new(device, params.width, params.height))),
        _ => None,
    }
}

fn start_client(
    config: &LoopbackConfig,
    negotiated: NegotiatedParams,
    events: ClientEventSender,
) -> Result<Arc<DecodeRenderPipeline>, StreamError> {
    let renderer = HeadlessRenderer::new().with_refresh_rate(negotiated.refresh_rate);
    let overlays: Vec<Box<dyn Overlay>> = vec![Box::new(StatsOverlay::new(config.stats_log_interval()))];
    let client = DecodeRenderPipeline::create(
        config.to_client_params(negotiated, events),
        Box::new(renderer),
        make_decoder,
        overlays,
    )?;
    // Host and client share this process's clock.
    client.set_time_diff(0);
    client.start()?;
    Ok(Arc::new(client))
}

async fn stop_client(client: Arc<DecodeRenderPipeline>) {
    if let Err(e) = tokio::task::spawn_blocking(move || client.stop()).await {
        error!("client stop task failed: {e}");
    }
}

/// `start` blocks until the capture thread reports in.
async fn start_host(mut host: CaptureEncodePipeline) -> Result<CaptureEncodePipeline, StreamError> {
    tokio::task::spawn_blocking(move || host.start().map(|()| host))
        .await
        .map_err(|e| StreamError::Other(format!("host start task failed: {e}")))?
}

async fn stop_host(mut host: CaptureEncodePipeline) {
    if let Err(e) = tokio::task::spawn_blocking(move || host.stop()).await {
        error!("host stop task failed: {e}");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────
