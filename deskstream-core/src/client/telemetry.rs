//! Client-side telemetry and frame statistics.
//!
//! [`Telemetry`] holds the transport figures the owner feeds in (rtt,
//! bandwidth estimate, NACKs, loss, clock offset). The render loop turns
//! them into periodic `SendSideStat` reports for the host, and the UI
//! can ask for a suggested bitrate.
//!
//! [`StatsTracker`] measures what the render thread actually achieved.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::media::render::RenderStats;
use crate::protocol::SendSideStat;

// ── Telemetry ────────────────────────────────────────────────────

/// Transport telemetry, written by the owner and read by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    /// Client clock minus host clock, microseconds.
    pub time_diff_us: i64,
    pub rtt_ms: u32,
    pub bwe_bps: u64,
    /// NACKs since the last `SendSideStat`.
    pub nack: u32,
    pub loss_rate: f32,
    dirty: bool,
}

impl Telemetry {
    pub fn set_time_diff(&mut self, us: i64) {
        self.time_diff_us = us;
    }

    pub fn set_rtt(&mut self, ms: u32) {
        self.rtt_ms = ms;
    }

    pub fn set_bwe(&mut self, bps: u64) {
        self.bwe_bps = bps;
        self.dirty = true;
    }

    pub fn add_nacks(&mut self, count: u32) {
        self.nack = self.nack.saturating_add(count);
        self.dirty = true;
    }

    pub fn set_loss_rate(&mut self, rate: f32) {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self.dirty = true;
    }

    /// The report for the host, if anything changed since the last one.
    /// Resets the NACK counter.
    pub fn take_send_side_stat(&mut self) -> Option<SendSideStat> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(SendSideStat {
            nack: std::mem::take(&mut self.nack),
            bwe_bps: self.bwe_bps,
            loss_rate: self.loss_rate,
        })
    }

    /// A bitrate the link should sustain: 90 % of the estimate, reduced
    /// further by the loss rate, never above `cap_bps`.
    pub fn suggested_bitrate_bps(&self, cap_bps: u64) -> Option<u64> {
        if self.bwe_bps == 0 {
            return None;
        }
        let factor = 0.9 * (1.0 - self.loss_rate.clamp(0.0, 0.5) as f64);
        Some(((self.bwe_bps as f64 * factor) as u64).min(cap_bps))
    }
}

// ── StatsTracker ─────────────────────────────────────────────────

/// Presentation intervals kept for the fps average.
const FPS_SAMPLES: usize = 60;

/// Render-side counters behind [`RenderStats`].
#[derive(Debug, Default)]
pub struct StatsTracker {
    intervals: VecDeque<Duration>,
    last_present: Option<Instant>,
    latency_ms: Option<f32>,
    decoded: u64,
    rendered: u64,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&mut self) {
        self.decoded += 1;
    }

    pub fn record_present(&mut self, at: Instant) {
        if let Some(prev) = self.last_present {
            self.intervals.push_back(at.duration_since(prev));
            if self.intervals.len() > FPS_SAMPLES {
                self.intervals.pop_front();
            }
        }
        self.last_present = Some(at);
        self.rendered += 1;
    }

    /// Fold one frame's latency into the moving average (α = 1/8).
    pub fn record_latency(&mut self, capture_ts_us: u64, arrival_ts_us: u64, time_diff_us: i64) {
        let latency_us = arrival_ts_us as i64 - capture_ts_us as i64 - time_diff_us;
        let sample = latency_us.max(0) as f32 / 1000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(avg) => avg * 7.0 / 8.0 + sample / 8.0,
            None => sample,
        });
    }

    pub fn fps(&self) -> f32 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let avg = self.intervals.iter().map(Duration::as_secs_f32).sum::<f32>()
            / self.intervals.len() as f32;
        if avg > 0.0 { 1.0 / avg } else { 0.0 }
    }

    pub fn snapshot(&self, dropped_frames: u64, telemetry: &Telemetry) -> RenderStats {
        RenderStats {
            fps: self.fps(),
            decoded_frames: self.decoded,
            dropped_frames,
            rendered_frames: self.rendered,
            latency_ms: self.latency_ms.unwrap_or(0.0),
            rtt_ms: telemetry.rtt_ms,
            bwe_bps: telemetry.bwe_bps,
            loss_rate: telemetry.loss_rate,
        }
    }
}
