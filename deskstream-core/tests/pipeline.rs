//! Integration tests: host and client pipelines driven end to end with
//! mock codecs, the synthetic capturer and the headless renderer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use deskstream_core::client::{ClientEventReceiver, DecodeRenderPipeline};
use deskstream_core::host::{HostEventReceiver, select_encoder};
use deskstream_core::media::{
    BackendKind, BorrowedDevice, CaptureFormat, CapturedFrame, CodecType, CursorImage,
    CursorState, DecodeStatus, DecodedFrame, Decoder, DisplayMode, EncodeAbility, EncodedOutput,
    Encoder, EncoderFactory, EncoderParams, HeadlessRenderer, MouseMode, NegotiatedParams, Overlay,
    PatternCapturer, PixelFormat, ReconfigureRequest, RenderCounters, RenderOutcome, RenderStats,
    Renderer, ResourceId, SoftwareEncoderFactory, SurfaceHandle, now_us,
};
use deskstream_core::protocol::{
    CursorBitmap, CursorInfo, CursorShape, EncodedFrame, ReconfigureEncoder,
};
use deskstream_core::{
    Action, CaptureEncodePipeline, ClientEvent, ClientParams, HostEvent, HostParams, HostTuning,
    Message, StreamError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ── Helpers ──────────────────────────────────────────────────────

/// Poll `cond` until it holds, failing the test after five seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async move {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn next_host_event(rx: &mut HostEventReceiver) -> HostEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("host channel closed")
}

async fn next_encoded(rx: &mut HostEventReceiver) -> EncodedFrame {
    loop {
        if let HostEvent::Outbound(Message::EncodedFrame(f)) = next_host_event(rx).await {
            return f;
        }
    }
}

fn wire_frame(codec: CodecType, width: u32, height: u32, picture_id: u64) -> EncodedFrame {
    let now = now_us();
    EncodedFrame {
        codec,
        width,
        height,
        is_keyframe: picture_id == 0,
        picture_id,
        capture_ts_us: now,
        start_encode_ts_us: now,
        end_encode_ts_us: now,
        payload: Bytes::from_static(&[0, 0, 0, 1]),
    }
}

// ── Mock decoder ─────────────────────────────────────────────────

/// Records every picture it is asked to decode; statuses can be
/// scripted per picture id.
struct MockDecoder {
    calls: Arc<Mutex<Vec<u64>>>,
    script: HashMap<u64, DecodeStatus>,
}

impl MockDecoder {
    fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                script: HashMap::new(),
            },
            calls,
        )
    }

    fn with_status(mut self, picture_id: u64, status: DecodeStatus) -> Self {
        self.script.insert(picture_id, status);
        self
    }
}

impl Decoder for MockDecoder {
    fn decode(&mut self, frame: &EncodedFrame) -> DecodedFrame {
        self.calls.lock().push(frame.picture_id);
        match self.script.get(&frame.picture_id) {
            Some(&status) => DecodedFrame::with_status(status),
            None => DecodedFrame::ok(ResourceId((frame.picture_id % 3) as u32)),
        }
    }

    fn textures(&self) -> Vec<ResourceId> {
        (0..3).map(ResourceId).collect()
    }

    fn decoded_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }
}

fn client(
    decoder: MockDecoder,
    mode: DisplayMode,
    codec: CodecType,
) -> (DecodeRenderPipeline, ClientEventReceiver, Arc<RenderCounters>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = HeadlessRenderer::new();
    let counters = renderer.counters();
    let negotiated = NegotiatedParams::new(mode, EncodeAbility::new(codec, BackendKind::Nvidia), false);
    let pipeline = DecodeRenderPipeline::create(
        ClientParams::new()
            .negotiated(negotiated)
            .surface(SurfaceHandle(1))
            .events(tx),
        Box::new(renderer),
        move |_, _| Some(Box::new(decoder) as Box<dyn Decoder>),
        Vec::new(),
    )
    .unwrap();
    pipeline.start().unwrap();
    (pipeline, rx, counters)
}

// ── Scripted renderer ────────────────────────────────────────────

/// Shared between a test and the [`ScriptedRenderer`] its render
/// thread owns.
#[derive(Default)]
struct RenderScript {
    /// Returned by `render` in order, then `Success`.
    outcomes: Mutex<VecDeque<RenderOutcome>>,
    /// While set, the swap chain never becomes ready.
    hold: AtomicBool,
    /// What `reset_render_target` reports.
    target_recovers: AtomicBool,
    rendered: Mutex<Vec<ResourceId>>,
    target_resets: AtomicU32,
    cursors: Mutex<Vec<CursorState>>,
    mouse_modes: Mutex<Vec<MouseMode>>,
    stretch: Mutex<Vec<bool>>,
}

struct ScriptedRenderer(Arc<RenderScript>);

impl Renderer for ScriptedRenderer {
    fn device(&self) -> BorrowedDevice {
        BorrowedDevice::NONE
    }

    fn bind_textures(&mut self, _textures: &[ResourceId], _format: PixelFormat) -> bool {
        true
    }

    fn wait_for_pipeline(&mut self, timeout: Duration) -> bool {
        if self.0.hold.load(Ordering::SeqCst) {
            std::thread::sleep(timeout);
            return false;
        }
        true
    }

    fn render(&mut self, resource: ResourceId) -> RenderOutcome {
        let outcome = self
            .0
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(RenderOutcome::Success);
        if outcome == RenderOutcome::Success {
            self.0.rendered.lock().push(resource);
        }
        outcome
    }

    fn present(&mut self) -> RenderOutcome {
        RenderOutcome::Success
    }

    fn update_cursor(&mut self, cursor: &CursorState) {
        self.0.cursors.lock().push(cursor.clone());
    }

    fn switch_mouse_mode(&mut self, mode: MouseMode) {
        self.0.mouse_modes.lock().push(mode);
    }

    fn switch_stretch_mode(&mut self, stretch: bool) {
        self.0.stretch.lock().push(stretch);
    }

    fn reset_render_target(&mut self) -> bool {
        self.0.target_resets.fetch_add(1, Ordering::SeqCst);
        self.0.target_recovers.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct OverlayLog {
    renders: AtomicU32,
    resets: AtomicU32,
}

struct CountingOverlay(Arc<OverlayLog>);

impl Overlay for CountingOverlay {
    fn render(&mut self, _stats: &RenderStats) -> RenderOutcome {
        self.0.renders.fetch_add(1, Ordering::SeqCst);
        RenderOutcome::Success
    }

    fn reset(&mut self) -> bool {
        self.0.resets.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn scripted_client(
    script: Arc<RenderScript>,
    overlay: Arc<OverlayLog>,
) -> (DecodeRenderPipeline, ClientEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (decoder, _) = MockDecoder::new();
    let negotiated = NegotiatedParams::new(
        DisplayMode::new(640, 360, 60),
        EncodeAbility::new(CodecType::H264, BackendKind::Nvidia),
        false,
    );
    let pipeline = DecodeRenderPipeline::create(
        ClientParams::new()
            .negotiated(negotiated)
            .surface(SurfaceHandle(1))
            .events(tx),
        Box::new(ScriptedRenderer(script)),
        move |_, _| Some(Box::new(decoder) as Box<dyn Decoder>),
        vec![Box::new(CountingOverlay(overlay)) as Box<dyn Overlay>],
    )
    .unwrap();
    pipeline.start().unwrap();
    (pipeline, rx)
}

/// Whether no `RenderStopped` has been reported so far.
fn render_still_running(rx: &mut ClientEventReceiver) -> bool {
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ClientEvent::RenderStopped { .. }) {
            return false;
        }
    }
    true
}

async fn next_cursor_info(rx: &mut HostEventReceiver) -> CursorInfo {
    loop {
        if let HostEvent::Outbound(Message::CursorInfo(info)) = next_host_event(rx).await {
            return info;
        }
    }
}

// ── Mock hardware encoder ────────────────────────────────────────

#[derive(Default)]
struct EncoderLog {
    reconfigures: Mutex<Vec<ReconfigureRequest>>,
    keyframe_requests: AtomicU32,
}

struct MockEncoder {
    ability: EncodeAbility,
    log: Arc<EncoderLog>,
    force_keyframe: bool,
}

impl Encoder for MockEncoder {
    fn backend(&self) -> BackendKind {
        self.ability.backend
    }

    fn codec(&self) -> CodecType {
        self.ability.codec
    }

    fn encode(&mut self, frame: &CapturedFrame) -> Option<EncodedOutput> {
        let is_keyframe = std::mem::take(&mut self.force_keyframe);
        Some(EncodedOutput {
            payload: Bytes::from(frame.timestamp_us.to_le_bytes().to_vec()),
            is_keyframe,
        })
    }

    fn reconfigure(&mut self, request: &ReconfigureRequest) -> bool {
        self.log.reconfigures.lock().push(*request);
        true
    }

    fn request_keyframe(&mut self) {
        self.log.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        self.force_keyframe = true;
    }

    fn capture_format(&self) -> CaptureFormat {
        CaptureFormat {
            pixel: PixelFormat::Nv12,
            cpu_readable: false,
        }
    }
}

/// Hardware factory where only the listed combinations come up.
struct MockFactory {
    backends: Vec<BackendKind>,
    working: Vec<EncodeAbility>,
    log: Arc<EncoderLog>,
}

impl MockFactory {
    fn new(backends: Vec<BackendKind>, working: Vec<EncodeAbility>) -> Self {
        Self {
            backends,
            working,
            log: Arc::new(EncoderLog::default()),
        }
    }
}

impl EncoderFactory for MockFactory {
    fn abilities(&self) -> Vec<EncodeAbility> {
        self.working.clone()
    }

    fn hardware_backends(&self) -> Vec<BackendKind> {
        self.backends.clone()
    }

    fn create_hard(&self, backend: BackendKind, params: &EncoderParams) -> Option<Box<dyn Encoder>> {
        let ability = EncodeAbility::new(params.codec, backend);
        self.working.contains(&ability).then(|| {
            Box::new(MockEncoder {
                ability,
                log: self.log.clone(),
                force_keyframe: true,
            }) as Box<dyn Encoder>
        })
    }

    fn create_soft(&self, _params: &EncoderParams) -> Option<Box<dyn Encoder>> {
        None
    }
}

fn host_params(mode: DisplayMode, prefs: Vec<CodecType>) -> HostParams {
    HostParams {
        mode,
        codec_preferences: prefs,
        initial_bitrate_bps: 10_000_000,
        max_bitrate_bps: 20_000_000,
        tuning: HostTuning::default(),
    }
}

fn h264_nvidia() -> MockFactory {
    MockFactory::new(
        vec![BackendKind::Nvidia],
        vec![EncodeAbility::new(CodecType::H264, BackendKind::Nvidia)],
    )
}

// ── Client pipeline ──────────────────────────────────────────────

#[tokio::test]
async fn decode_order_matches_submission_order() {
    let mode = DisplayMode::new(640, 360, 60);
    let (decoder, calls) = MockDecoder::new();
    let (pipeline, _rx, _) = client(decoder, mode, CodecType::H264);

    for id in 0..20 {
        assert_eq!(pipeline.submit(wire_frame(CodecType::H264, 640, 360, id)), Action::None);
    }
    wait_until(|| calls.lock().len() == 20).await;
    assert_eq!(*calls.lock(), (0..20).collect::<Vec<_>>());
    pipeline.stop();
}

#[tokio::test]
async fn failed_decode_requests_exactly_one_keyframe() {
    let mode = DisplayMode::new(640, 360, 60);
    let (decoder, calls) = MockDecoder::new();
    let decoder = decoder.with_status(1, DecodeStatus::Failed);
    let (pipeline, _rx, _) = client(decoder, mode, CodecType::H264);

    for id in 0..3 {
        assert_eq!(pipeline.submit(wire_frame(CodecType::H264, 640, 360, id)), Action::None);
    }
    // Picture 2 reaching the decoder means picture 1 has been handled.
    wait_until(|| calls.lock().len() == 3).await;

    assert_eq!(
        pipeline.submit(wire_frame(CodecType::H264, 640, 360, 3)),
        Action::RequestKeyFrame
    );
    assert_eq!(pipeline.submit(wire_frame(CodecType::H264, 640, 360, 4)), Action::None);
    pipeline.stop();
}

#[tokio::test]
async fn need_reset_raises_one_reset_and_stops_decoding() {
    let mode = DisplayMode::new(640, 360, 60);
    let (decoder, calls) = MockDecoder::new();
    let decoder = decoder.with_status(3, DecodeStatus::NeedReset);
    let (pipeline, mut rx, _) = client(decoder, mode, CodecType::H264);

    for id in 0..10 {
        pipeline.submit(wire_frame(CodecType::H264, 640, 360, id));
    }

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    match event {
        ClientEvent::ResetRequested { instance, cause } => {
            assert_eq!(instance, pipeline.instance());
            assert!(matches!(
                cause,
                StreamError::DecodeFatal {
                    status: DecodeStatus::NeedReset
                }
            ));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Frames submitted after the failure are never decoded.
    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 10));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*calls.lock(), vec![0, 1, 2, 3]);

    let mut resets = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ClientEvent::ResetRequested { .. }) {
            resets += 1;
        }
    }
    assert_eq!(resets, 0);
    pipeline.stop();
}

#[tokio::test]
async fn end_to_end_1080p60_h264() {
    let mode = DisplayMode::new(1920, 1080, 60);
    let (decoder, calls) = MockDecoder::new();
    let (pipeline, _rx, counters) = client(decoder, mode, CodecType::H264);

    for id in 0..10 {
        pipeline.submit(wire_frame(CodecType::H264, 1920, 1080, id));
        assert!(pipeline.smoother_size() <= 1);
        tokio::time::sleep(Duration::from_millis(16)).await;
        assert!(pipeline.smoother_size() <= 1);
    }

    wait_until(|| pipeline.stats().decoded_frames == 10).await;
    wait_until(|| counters.presented() > 0).await;
    assert_eq!(*calls.lock(), (0..10).collect::<Vec<_>>());
    pipeline.stop();
}

#[tokio::test]
async fn render_failure_stops_the_render_thread() {
    let script = Arc::new(RenderScript::default());
    script.outcomes.lock().push_back(RenderOutcome::Failed);
    let (pipeline, mut rx) = scripted_client(script, Arc::new(OverlayLog::default()));
    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert!(matches!(
        event,
        ClientEvent::RenderStopped {
            cause: StreamError::RenderFatal,
            ..
        }
    ));
    pipeline.stop();
}

#[tokio::test]
async fn eagain_raises_a_reset() {
    let mode = DisplayMode::new(640, 360, 60);
    let (decoder, calls) = MockDecoder::new();
    let decoder = decoder.with_status(2, DecodeStatus::EAgain);
    let (pipeline, mut rx, _) = client(decoder, mode, CodecType::H264);

    for id in 0..5 {
        pipeline.submit(wire_frame(CodecType::H264, 640, 360, id));
    }
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    assert!(matches!(
        event,
        ClientEvent::ResetRequested {
            cause: StreamError::DecodeFatal {
                status: DecodeStatus::EAgain
            },
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock(), vec![0, 1, 2]);
    pipeline.stop();
}

#[tokio::test]
async fn smoother_holds_the_latest_frame_until_render_takes_it() {
    let script = Arc::new(RenderScript::default());
    script.hold.store(true, Ordering::SeqCst);
    let (pipeline, _rx) = scripted_client(script.clone(), Arc::new(OverlayLog::default()));

    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));
    wait_until(|| pipeline.smoother_size() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pipeline.smoother_size(), 1);

    // A newer frame replaces the unconsumed one.
    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 1));
    wait_until(|| pipeline.stats().dropped_frames == 1).await;
    assert_eq!(pipeline.smoother_size(), 1);
    assert!(script.rendered.lock().is_empty());

    script.hold.store(false, Ordering::SeqCst);
    wait_until(|| pipeline.smoother_size() == 0).await;
    wait_until(|| !script.rendered.lock().is_empty()).await;
    assert_eq!(script.rendered.lock()[0], ResourceId(1));
    pipeline.stop();
}

#[tokio::test]
async fn last_frame_is_presented_again_when_nothing_new_arrives() {
    let script = Arc::new(RenderScript::default());
    let (pipeline, _rx) = scripted_client(script.clone(), Arc::new(OverlayLog::default()));

    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));
    wait_until(|| script.rendered.lock().len() >= 3).await;
    assert!(script.rendered.lock().iter().all(|r| *r == ResourceId(0)));
    assert_eq!(pipeline.stats().decoded_frames, 1);
    pipeline.stop();
}

#[tokio::test]
async fn renderer_reset_reinitialises_overlays_and_keeps_rendering() {
    let script = Arc::new(RenderScript::default());
    script.outcomes.lock().push_back(RenderOutcome::Reset);
    let overlay = Arc::new(OverlayLog::default());
    let (pipeline, mut rx) = scripted_client(script.clone(), overlay.clone());

    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));
    wait_until(|| overlay.resets.load(Ordering::SeqCst) == 1).await;

    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 1));
    wait_until(|| script.rendered.lock().contains(&ResourceId(1))).await;
    wait_until(|| overlay.renders.load(Ordering::SeqCst) > 0).await;
    assert_eq!(overlay.resets.load(Ordering::SeqCst), 1);
    assert!(render_still_running(&mut rx));
    pipeline.stop();
}

#[tokio::test]
async fn render_target_is_recreated_on_request() {
    let script = Arc::new(RenderScript::default());
    script.target_recovers.store(true, Ordering::SeqCst);
    let (pipeline, mut rx) = scripted_client(script.clone(), Arc::new(OverlayLog::default()));

    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));
    wait_until(|| !script.rendered.lock().is_empty()).await;

    pipeline.reset_render_target();
    wait_until(|| script.target_resets.load(Ordering::SeqCst) == 1).await;
    let before = script.rendered.lock().len();
    wait_until(|| script.rendered.lock().len() > before).await;
    assert!(render_still_running(&mut rx));
    pipeline.stop();
}

#[tokio::test]
async fn unrecoverable_render_target_stops_the_render_thread() {
    let script = Arc::new(RenderScript::default());
    let (pipeline, mut rx) = scripted_client(script.clone(), Arc::new(OverlayLog::default()));

    pipeline.reset_render_target();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    match event {
        ClientEvent::RenderStopped { instance, cause } => {
            assert_eq!(instance, pipeline.instance());
            assert!(matches!(cause, StreamError::RenderDeviceLost));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(script.target_resets.load(Ordering::SeqCst), 1);
    pipeline.stop();
}

#[tokio::test]
async fn cursor_and_modes_reach_the_renderer() {
    let script = Arc::new(RenderScript::default());
    let (pipeline, _rx) = scripted_client(script.clone(), Arc::new(OverlayLog::default()));

    pipeline.set_cursor_info(CursorInfo {
        x: 3,
        y: 4,
        visible: true,
        shape: CursorShape::Preset(5),
    });
    wait_until(|| !script.cursors.lock().is_empty()).await;
    let first = script.cursors.lock()[0].clone();
    assert_eq!((first.x, first.y), (3, 4));
    assert_eq!(first.image, CursorImage::Preset(5));

    let bitmap = CursorBitmap {
        width: 1,
        height: 1,
        hotspot_x: 0,
        hotspot_y: 0,
        data: Bytes::from_static(&[9, 9, 9, 9]),
    };
    pipeline.set_cursor_info(CursorInfo {
        x: 0,
        y: 0,
        visible: true,
        shape: CursorShape::Bitmap {
            bitmap: bitmap.clone(),
            dedup_id: 9,
        },
    });
    pipeline.set_cursor_info(CursorInfo {
        x: 7,
        y: 8,
        visible: true,
        shape: CursorShape::Cached(9),
    });
    wait_until(|| script.cursors.lock().last().is_some_and(|c| c.x == 7)).await;
    assert_eq!(
        script.cursors.lock().last().map(|c| c.image.clone()),
        Some(CursorImage::Bitmap(Arc::new(bitmap)))
    );

    pipeline.switch_mouse_mode(MouseMode::Relative);
    pipeline.switch_stretch_mode(true);
    wait_until(|| script.mouse_modes.lock().last() == Some(&MouseMode::Relative)).await;
    wait_until(|| script.stretch.lock().last() == Some(&true)).await;
    pipeline.stop();
}

#[tokio::test]
async fn telemetry_is_reported_to_the_host() {
    let mode = DisplayMode::new(640, 360, 60);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (decoder, _) = MockDecoder::new();
    let negotiated = NegotiatedParams::new(mode, EncodeAbility::new(CodecType::H264, BackendKind::Nvidia), false);
    let tuning = deskstream_core::ClientTuning {
        stat_interval_ms: 10,
        ..Default::default()
    };
    let pipeline = DecodeRenderPipeline::create(
        ClientParams::new()
            .negotiated(negotiated)
            .surface(SurfaceHandle(1))
            .events(tx)
            .tuning(tuning),
        Box::new(HeadlessRenderer::new()),
        move |_, _| Some(Box::new(decoder) as Box<dyn Decoder>),
        Vec::new(),
    )
    .unwrap();
    pipeline.start().unwrap();
    pipeline.submit(wire_frame(CodecType::H264, 640, 360, 0));
    pipeline.set_bwe(12_000_000);
    pipeline.set_nack(4);

    let stat = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ClientEvent::Outbound(Message::SendSideStat(s))) = rx.recv().await {
                return s;
            }
        }
    })
    .await
    .expect("no SendSideStat");
    assert_eq!(stat.bwe_bps, 12_000_000);
    assert_eq!(stat.nack, 4);
    pipeline.stop();
}

// ── Host pipeline ────────────────────────────────────────────────

#[tokio::test]
async fn host_picture_ids_strictly_increase() {
    let mode = DisplayMode::new(64, 32, 120);
    let factory = h264_nvidia();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H264]),
        Box::new(PatternCapturer::new(mode)),
        &factory,
        tx,
    )
    .unwrap();
    host.start().unwrap();

    let first = next_encoded(&mut rx).await;
    assert!(first.is_keyframe);
    assert_eq!(first.codec, CodecType::H264);
    let mut prev = first.picture_id;
    for _ in 0..9 {
        let frame = next_encoded(&mut rx).await;
        assert!(frame.picture_id > prev);
        assert!(frame.end_encode_ts_us >= frame.start_encode_ts_us);
        assert!(frame.start_encode_ts_us >= frame.capture_ts_us);
        prev = frame.picture_id;
    }
    host.stop();
}

#[test]
fn hardware_selection_follows_preference_then_host_order() {
    let factory = MockFactory::new(
        vec![BackendKind::Nvidia, BackendKind::Intel],
        vec![
            EncodeAbility::new(CodecType::H264, BackendKind::Intel),
            EncodeAbility::new(CodecType::H265, BackendKind::Intel),
        ],
    );
    let base = EncoderParams {
        codec: CodecType::H265,
        width: 1920,
        height: 1080,
        fps: 60,
        bitrate_bps: 10_000_000,
        device: BorrowedDevice::NONE,
    };
    let selected =
        select_encoder(&factory, &[CodecType::H265, CodecType::H264], &base, 30).unwrap();
    assert_eq!(
        selected.ability,
        EncodeAbility::new(CodecType::H265, BackendKind::Intel)
    );
    assert_eq!(selected.fps, 60);
}

#[test]
fn software_fallback_runs_at_the_ceiling() {
    let mode = DisplayMode::new(64, 32, 60);
    let (tx, _rx) = mpsc::unbounded_channel();
    let host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H264, CodecType::Zstd]),
        Box::new(PatternCapturer::new(mode)),
        &SoftwareEncoderFactory,
        tx,
    )
    .unwrap();
    assert_eq!(host.ability(), EncodeAbility::new(CodecType::Zstd, BackendKind::Software));
    assert_eq!(host.fps(), 30);
}

#[test]
fn no_encoder_means_no_pipeline() {
    let mode = DisplayMode::new(64, 32, 60);
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H265]),
        Box::new(PatternCapturer::new(mode)),
        &h264_nvidia(),
        tx,
    )
    .err()
    .unwrap();
    assert!(matches!(err, StreamError::EncoderCreateFailure(_)));
}

#[tokio::test]
async fn resolution_change_emits_params_then_terminates() {
    let mode = DisplayMode::new(64, 32, 120);
    let next = DisplayMode::new(48, 24, 120);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::Zstd]),
        Box::new(PatternCapturer::new(mode).with_mode_change(5, next)),
        &SoftwareEncoderFactory,
        tx,
    )
    .unwrap();
    host.start().unwrap();

    let mut last_outbound = None;
    let cause = loop {
        match next_host_event(&mut rx).await {
            HostEvent::Outbound(msg) => last_outbound = Some(msg),
            HostEvent::Terminated(cause) => break cause,
        }
    };
    assert_eq!(last_outbound, Some(Message::ChangeStreamingParams(next.into())));
    assert!(matches!(
        cause,
        StreamError::ResolutionChanged {
            width: 48,
            height: 24,
            refresh_rate: 120
        }
    ));
    wait_until(|| !host.is_running()).await;

    // Nothing drains tasks once the capture thread has gone.
    let control = host.control();
    wait_until(|| control.is_closed()).await;
    control.request_keyframe();
    assert_eq!(control.pending(), 0);
    host.stop();
}

#[tokio::test]
async fn reconfigure_is_clamped_and_manual_mode_sticks() {
    let mode = DisplayMode::new(64, 32, 120);
    let factory = h264_nvidia();
    let log = factory.log.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H264]),
        Box::new(PatternCapturer::new(mode)),
        &factory,
        tx,
    )
    .unwrap();
    let control = host.control();
    host.start().unwrap();

    control.reconfigure(ReconfigureEncoder::manual(500_000_000));
    wait_until(|| log.reconfigures.lock().len() == 1).await;
    assert_eq!(log.reconfigures.lock()[0].bitrate_bps, Some(20_000_000));

    // Automatic requests are ignored while manual.
    assert!(control.handle_message(Message::ReconfigureEncoder(ReconfigureEncoder::auto(
        2_000_000
    ))));
    for _ in 0..5 {
        next_encoded(&mut rx).await;
    }
    assert_eq!(log.reconfigures.lock().len(), 1);
    host.stop();
}

#[tokio::test]
async fn queued_keyframe_requests_collapse() {
    let mode = DisplayMode::new(64, 32, 120);
    let factory = h264_nvidia();
    let log = factory.log.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H264]),
        Box::new(PatternCapturer::new(mode)),
        &factory,
        tx,
    )
    .unwrap();
    let control = host.control();
    control.request_keyframe();
    control.request_keyframe();
    control.request_keyframe();
    host.start().unwrap();

    next_encoded(&mut rx).await;
    assert_eq!(log.keyframe_requests.load(Ordering::SeqCst), 1);
    host.stop();
}

#[tokio::test]
async fn cursor_bitmap_is_sent_once_then_referenced() {
    let mode = DisplayMode::new(64, 32, 120);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::Zstd]),
        Box::new(PatternCapturer::new(mode)),
        &SoftwareEncoderFactory,
        tx,
    )
    .unwrap();
    host.start().unwrap();

    let mut shapes = Vec::new();
    while shapes.len() < 2 {
        if let HostEvent::Outbound(Message::CursorInfo(info)) = next_host_event(&mut rx).await {
            shapes.push(info.shape);
        }
    }
    let CursorShape::Bitmap { dedup_id, .. } = &shapes[0] else {
        panic!("first cursor must carry the bitmap");
    };
    assert_eq!(shapes[1], CursorShape::Cached(*dedup_id));
    host.stop();
}

#[tokio::test]
async fn legacy_cursor_is_used_when_the_compositor_has_none() {
    let mode = DisplayMode::new(64, 32, 120);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::Zstd]),
        Box::new(PatternCapturer::new(mode).with_compositor_cursor(false)),
        &SoftwareEncoderFactory,
        tx,
    )
    .unwrap();
    host.start().unwrap();

    let info = next_cursor_info(&mut rx).await;
    assert_eq!(info.shape, CursorShape::Preset(0));
    host.stop();
}

#[tokio::test]
async fn rebuilt_client_gets_the_cursor_bitmap_again() {
    // Large enough for the synthetic cursor to move every frame.
    let mode = DisplayMode::new(640, 360, 120);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut host = CaptureEncodePipeline::create(
        host_params(mode, vec![CodecType::H264]),
        Box::new(PatternCapturer::new(mode)),
        &h264_nvidia(),
        tx,
    )
    .unwrap();
    let control = host.control();
    host.start().unwrap();

    let (first, _first_rx, first_counters) = client(MockDecoder::new().0, mode, CodecType::H264);
    let info = next_cursor_info(&mut rx).await;
    let CursorShape::Bitmap { bitmap: original, .. } = info.shape.clone() else {
        panic!("first cursor must carry the bitmap");
    };
    first.set_cursor_info(info);
    for _ in 0..3 {
        let info = next_cursor_info(&mut rx).await;
        assert!(matches!(info.shape, CursorShape::Cached(_)));
        first.set_cursor_info(info);
    }
    wait_until(|| first_counters.last_cursor.lock().is_some()).await;
    first.stop();

    // The owner asks for a keyframe after every client rebuild.
    let (second, _second_rx, counters) = client(MockDecoder::new().0, mode, CodecType::H264);
    control.request_keyframe();

    let resent = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let info = next_cursor_info(&mut rx).await;
            let shape = info.shape.clone();
            second.set_cursor_info(info);
            if let CursorShape::Bitmap { bitmap, .. } = shape {
                return bitmap;
            }
        }
    })
    .await
    .expect("cursor bitmap not resent");
    assert_eq!(resent, original);

    wait_until(|| {
        matches!(
            counters.last_cursor.lock().as_ref().map(|c| &c.image),
            Some(CursorImage::Bitmap(_))
        )
    })
    .await;
    host.stop();
    second.stop();
}
