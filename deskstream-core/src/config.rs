//! Tuning knobs for the host and client pipelines.
//!
//! These values were empirical constants in earlier builds; they are
//! now plain configuration so deployments can adjust them without
//! touching the pipeline code. Binaries embed them in their TOML files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Host-side (capture → encode) tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostTuning {
    /// Frame-rate ceiling applied when only the software encoder works.
    pub soft_fps_ceiling: u32,
    /// Throttling engages once the observed capture rate exceeds
    /// `target + throttle_hysteresis_fps`.
    pub throttle_hysteresis_fps: u32,
    /// Lower bound for automatic bitrate adjustment (bits/s).
    pub min_bitrate_bps: u64,
    /// Maximum time one `capture()` call may wait for a frame.
    pub capture_timeout_ms: u64,
    /// How long `start()` waits for the capture thread to report.
    pub start_timeout_ms: u64,
    /// Smoothed loss rate above which the bitrate backs off.
    pub backoff_loss_rate: f32,
    /// NACK count per report above which the bitrate backs off.
    pub backoff_nack_count: u32,
    /// Multiplier applied on back-off (< 1.0).
    pub backoff_ratio: f32,
    /// Multiplier applied when probing upward (> 1.0).
    pub probe_ratio: f32,
}

impl Default for HostTuning {
    fn default() -> Self {
        Self {
            soft_fps_ceiling: 30,
            throttle_hysteresis_fps: 2,
            min_bitrate_bps: 1_000_000,
            capture_timeout_ms: 100,
            start_timeout_ms: 3_000,
            backoff_loss_rate: 0.10,
            backoff_nack_count: 20,
            backoff_ratio: 0.85,
            probe_ratio: 1.10,
        }
    }
}

impl HostTuning {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

/// Client-side (decode → render) tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTuning {
    /// Bounded wait of the decode thread on its input queue.
    pub decode_wait_ms: u64,
    /// Bounded wait of the render thread (one frame at 60 Hz).
    pub render_wait_ms: u64,
    /// Minimum interval between `SendSideStat` reports to the host.
    pub stat_interval_ms: u64,
    /// Queue depth at which the decode queue is reported as backed up.
    pub queue_warn_depth: usize,
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            decode_wait_ms: 5,
            render_wait_ms: 16,
            stat_interval_ms: 1_000,
            queue_warn_depth: 30,
        }
    }
}

impl ClientTuning {
    pub fn decode_wait(&self) -> Duration {
        Duration::from_millis(self.decode_wait_ms.max(1))
    }

    pub fn render_wait(&self) -> Duration {
        Duration::from_millis(self.render_wait_ms.max(1))
    }

    pub fn stat_interval(&self) -> Duration {
        Duration::from_millis(self.stat_interval_ms)
    }
}
