//! Screen capture collaborator.
//!
//! The [`Capturer`] trait is the host pipeline's view of a desktop
//! duplication backend. Platform implementations live outside this
//! crate; [`PatternCapturer`] is a synthetic, vblank-paced source used
//! by the loopback binary and by tests.

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use crate::error::StreamError;
use crate::media::device::{BorrowedDevice, OwnedDevice};
use crate::media::types::{
    CaptureFormat, CapturedFrame, CursorSnapshot, CursorSource, DisplayMode, FrameData,
    PixelFormat, SurfaceHandle, now_us,
};
use crate::protocol::CursorBitmap;

// ── Capturer ─────────────────────────────────────────────────────

/// A desktop capture backend.
///
/// All methods are called from the host pipeline's capture thread,
/// except `device`, `display_mode` and `set_capture_format`, which are
/// also called once during pipeline construction.
pub trait Capturer: Send {
    /// Begin capturing. Called once, on the capture thread.
    fn start(&mut self) -> Result<(), StreamError>;

    /// Wait for the next frame, at most `timeout`.
    ///
    /// Returns `None` when no new frame arrived in time.
    fn capture(&mut self, timeout: Duration) -> Option<CapturedFrame>;

    /// Hand a frame back to the capturer.
    fn done_with_frame(&mut self, frame: CapturedFrame);

    /// Cursor through the compositor-level API.
    fn cursor_compositor(&mut self) -> Option<CursorSnapshot>;

    /// Cursor through the legacy window-message API. Only consulted
    /// when the compositor path returns nothing.
    fn cursor_legacy(&mut self) -> Option<CursorSnapshot> {
        None
    }

    /// The capture device, lent to the encoder.
    fn device(&self) -> BorrowedDevice;

    /// The host's current display mode, re-queried every iteration.
    fn display_mode(&self) -> DisplayMode;

    /// Switch the output format to what the selected encoder consumes.
    fn set_capture_format(&mut self, format: CaptureFormat) -> Result<(), StreamError>;
}

// ── PatternCapturer ──────────────────────────────────────────────

const CURSOR_SIZE: u32 = 16;
/// Frames between synthetic cursor shape changes.
const CURSOR_SHAPE_PERIOD: u64 = 120;

/// Synthetic capturer producing a moving test pattern at the display's
/// refresh rate.
///
/// Display-mode changes can be scripted to exercise renegotiation.
pub struct PatternCapturer {
    mode: DisplayMode,
    scripted_modes: VecDeque<(u64, DisplayMode)>,
    device: OwnedDevice,
    format: CaptureFormat,
    started: bool,
    frames: u64,
    outstanding: u32,
    next_vblank: Option<Instant>,
    compositor_cursor: bool,
}

impl PatternCapturer {
    pub fn new(mode: DisplayMode) -> Self {
        Self {
            mode,
            scripted_modes: VecDeque::new(),
            device: OwnedDevice::new("pattern-capture"),
            format: CaptureFormat {
                pixel: PixelFormat::Bgra8,
                cpu_readable: false,
            },
            started: false,
            frames: 0,
            outstanding: 0,
            next_vblank: None,
            compositor_cursor: true,
        }
    }

    /// Switch the reported display mode once `after_frames` frames
    /// have been captured.
    pub fn with_mode_change(mut self, after_frames: u64, mode: DisplayMode) -> Self {
        self.scripted_modes.push_back((after_frames, mode));
        self
    }

    /// Disable the compositor cursor path, forcing the legacy fallback.
    pub fn with_compositor_cursor(mut self, enabled: bool) -> Self {
        self.compositor_cursor = enabled;
        self
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.mode.refresh_rate.max(1) as f64)
    }

    /// Sleep until the next vblank, or give up after `timeout`.
    fn wait_vblank(&mut self, timeout: Duration) -> bool {
        let interval = self.frame_interval();
        let now = Instant::now();
        let due = self.next_vblank.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }

        // Skip missed vblanks instead of bursting to catch up.
        let after = Instant::now();
        let mut next = due + interval;
        while next <= after {
            next += interval;
        }
        self.next_vblank = Some(next);
        true
    }

    fn render_pattern(&self) -> (u32, Bytes) {
        let (w, h) = (self.mode.width, self.mode.height);
        let stride = w * 4;
        let band_x = (self.frames * 8 % w.max(1) as u64) as u32;
        let mut data = Vec::with_capacity(stride as usize * h as usize);
        for y in 0..h {
            for x in 0..w {
                if x >= band_x && x < band_x + 32 {
                    data.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                } else {
                    data.extend_from_slice(&[(y & 0xFF) as u8, (x & 0xFF) as u8, 0x40, 0xFF]);
                }
            }
        }
        (stride, Bytes::from(data))
    }

    fn cursor_position(&self) -> (i32, i32) {
        let t = self.frames as f64 / 60.0;
        let cx = self.mode.width as f64 / 2.0;
        let cy = self.mode.height as f64 / 2.0;
        (
            (cx + cx * 0.5 * t.cos()) as i32,
            (cy + cy * 0.5 * t.sin()) as i32,
        )
    }
}

impl Capturer for PatternCapturer {
    fn start(&mut self) -> Result<(), StreamError> {
        if self.mode.width == 0 || self.mode.height == 0 {
            return Err(StreamError::CaptureStart(format!(
                "cannot capture a {} display",
                self.mode
            )));
        }
        self.started = true;
        self.next_vblank = Some(Instant::now());
        debug!(mode = %self.mode, "pattern capture started");
        Ok(())
    }

    fn capture(&mut self, timeout: Duration) -> Option<CapturedFrame> {
        if !self.started || !self.wait_vblank(timeout) {
            return None;
        }

        self.frames += 1;
        if let Some(&(at, mode)) = self.scripted_modes.front() {
            if self.frames >= at {
                debug!(from = %self.mode, to = %mode, "scripted display mode change");
                self.mode = mode;
                self.scripted_modes.pop_front();
            }
        }

        let data = if self.format.cpu_readable {
            let (stride, data) = self.render_pattern();
            FrameData::Cpu { stride, data }
        } else {
            FrameData::Surface(SurfaceHandle(self.frames % 3))
        };
        self.outstanding += 1;

        Some(CapturedFrame {
            width: self.mode.width,
            height: self.mode.height,
            format: self.format.pixel,
            data,
            timestamp_us: now_us(),
        })
    }

    fn done_with_frame(&mut self, _frame: CapturedFrame) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn cursor_compositor(&mut self) -> Option<CursorSnapshot> {
        if !self.compositor_cursor {
            return None;
        }
        let (x, y) = self.cursor_position();
        let shade = if (self.frames / CURSOR_SHAPE_PERIOD) % 2 == 0 {
            0xFF
        } else {
            0x80
        };
        Some(CursorSnapshot {
            x,
            y,
            visible: true,
            image: CursorSource::Bitmap(CursorBitmap {
                width: CURSOR_SIZE,
                height: CURSOR_SIZE,
                hotspot_x: 0,
                hotspot_y: 0,
                data: Bytes::from(vec![shade; (CURSOR_SIZE * CURSOR_SIZE * 4) as usize]),
            }),
        })
    }

    fn cursor_legacy(&mut self) -> Option<CursorSnapshot> {
        let (x, y) = self.cursor_position();
        Some(CursorSnapshot {
            x,
            y,
            visible: true,
            image: CursorSource::Preset(0),
        })
    }

    fn device(&self) -> BorrowedDevice {
        self.device.borrow()
    }

    fn display_mode(&self) -> DisplayMode {
        self.mode
    }

    fn set_capture_format(&mut self, format: CaptureFormat) -> Result<(), StreamError> {
        if format.cpu_readable && format.pixel != PixelFormat::Bgra8 {
            return Err(StreamError::CaptureStart(format!(
                "pattern capture cannot produce CPU {:?}",
                format.pixel
            )));
        }
        self.format = format;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
