//! Configuration for the loopback session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use deskstream_core::client::ClientEventSender;
use deskstream_core::media::{CodecType, DisplayMode, NegotiatedParams, SurfaceHandle};
use deskstream_core::{ClientParams, ClientTuning, HostParams, HostTuning};

/// Largest refresh rate the session accepts.
const MAX_REFRESH_RATE: u32 = 240;
/// Smallest picture edge the synthetic capturer produces.
const MIN_EDGE: u32 = 16;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Simulated host display.
    pub display: DisplayConfig,
    /// Codec preferences of the client.
    pub codec: CodecConfig,
    /// Host pipeline settings.
    pub host: HostConfig,
    /// Client pipeline settings.
    pub client: ClientConfig,
    /// The in-memory link between the two.
    pub link: LinkConfig,
    /// Session length and scripted events.
    pub session: SessionConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Simulated host display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Capture rate in Hz.
    pub refresh_rate: u32,
}

/// Client codec preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Most preferred first: "h264", "h265", "zstd".
    pub preferences: Vec<CodecType>,
    /// Stretch to the client surface instead of letterboxing.
    pub stretch: bool,
}

/// Host pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub initial_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
    /// Pin the bitrate from the client side, disabling automatic control.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_bitrate_bps: Option<u64>,
    pub tuning: HostTuning,
}

/// Client pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often the stats overlay logs, milliseconds.
    pub stats_log_interval_ms: u64,
    pub tuning: ClientTuning,
}

/// Simulated transport characteristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link capacity in bits/second.
    pub capacity_bps: u64,
    /// Round-trip time of an idle link, milliseconds.
    pub base_rtt_ms: u64,
    /// Fraction of packets lost and retransmitted, 0.0 – 1.0.
    pub loss_rate: f32,
    /// Queueing delay beyond which packets are dropped, milliseconds.
    pub max_queue_ms: u64,
    /// How often link telemetry is fed to the client, milliseconds.
    pub telemetry_interval_ms: u64,
}

/// A display-mode switch scripted into the synthetic capturer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChange {
    /// Frames captured by the current host pipeline before the switch.
    pub after_frames: u64,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

impl ModeChange {
    pub fn mode(&self) -> DisplayMode {
        clamp_mode(self.width, self.height, self.refresh_rate)
    }
}

/// Session length and scripted events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run time in seconds; 0 runs until stopped.
    pub duration_secs: u64,
    /// How long the host waits for `ChangeStreamingParamsAck`.
    pub ack_timeout_ms: u64,
    /// Applied in order, one per host pipeline instance.
    pub mode_changes: Vec<ModeChange>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_rate: 60,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            preferences: vec![CodecType::H264, CodecType::H265, CodecType::Zstd],
            stretch: false,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            initial_bitrate_bps: 8_000_000,
            max_bitrate_bps: 50_000_000,
            manual_bitrate_bps: None,
            tuning: HostTuning::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stats_log_interval_ms: 2_000,
            tuning: ClientTuning::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            capacity_bps: 100_000_000,
            base_rtt_ms: 2,
            loss_rate: 0.0,
            max_queue_ms: 200,
            telemetry_interval_ms: 250,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            ack_timeout_ms: 1_000,
            mode_changes: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl LoopbackConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// The initial display mode, clamped to what the capturer supports.
    pub fn display_mode(&self) -> DisplayMode {
        clamp_mode(self.display.width, self.display.height, self.display.refresh_rate)
    }

    /// `None` runs until stopped.
    pub fn duration(&self) -> Option<Duration> {
        (self.session.duration_secs > 0).then(|| Duration::from_secs(self.session.duration_secs))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.session.ack_timeout_ms.max(1))
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_millis(self.client.stats_log_interval_ms.max(100))
    }

    /// Host parameters for one pipeline instance.
    ///
    /// The host only offers the codec both sides agreed on.
    pub fn to_host_params(&self, mode: DisplayMode, codec: CodecType) -> HostParams {
        let tuning = self.host.tuning.clone();
        let max_bitrate_bps = self.host.max_bitrate_bps.max(tuning.min_bitrate_bps);
        HostParams {
            mode,
            codec_preferences: vec![codec],
            initial_bitrate_bps: self
                .host
                .initial_bitrate_bps
                .clamp(tuning.min_bitrate_bps, max_bitrate_bps),
            max_bitrate_bps,
            tuning,
        }
    }

    /// Client parameters for one pipeline instance.
    pub fn to_client_params(&self, negotiated: NegotiatedParams, events: ClientEventSender) -> ClientParams {
        ClientParams::new()
            .negotiated(negotiated)
            .surface(SurfaceHandle(1))
            .events(events)
            .tuning(self.client.tuning.clone())
    }
}

impl LinkConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms.max(10))
    }
}

fn clamp_mode(width: u32, height: u32, refresh_rate: u32) -> DisplayMode {
    DisplayMode::new(
        width.max(MIN_EDGE),
        height.max(MIN_EDGE),
        refresh_rate.clamp(1, MAX_REFRESH_RATE),
    )
}

// ── Tests ────────────────────────────────────────────────────────
