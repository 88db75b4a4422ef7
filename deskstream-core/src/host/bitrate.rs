//! Encoder bitrate control.
//!
//! Two sources change the encoder's rate:
//!
//! - **Reconfigure requests** from the client. `TurnOffAuto` switches to
//!   manual mode; `TurnOnAuto` returns to automatic mode; a request with
//!   no trigger is an automatic one and is rejected while manual.
//! - **Network feedback** (`SendSideStat`). Loss or NACK bursts back the
//!   bitrate off; spare estimated bandwidth probes it upward.
//!
//! Every value handed to the encoder is clamped to
//! `[min_bitrate, bitrate_cap]` and the fps to `1..=max_fps`.

use tracing::debug;

use crate::config::HostTuning;
use crate::media::types::ReconfigureRequest;
use crate::protocol::{ReconfigureEncoder, ReconfigureTrigger, SendSideStat};

/// Tracks the current encoder rate and the manual/automatic mode.
#[derive(Debug, Clone)]
pub struct BitrateController {
    cap_bps: u64,
    min_bps: u64,
    current_bps: u64,
    max_fps: u32,
    current_fps: u32,
    manual: bool,
    backoff_loss_rate: f32,
    backoff_nack_count: u32,
    backoff_ratio: f32,
    probe_ratio: f32,
}

impl BitrateController {
    pub fn new(initial_bps: u64, cap_bps: u64, max_fps: u32, tuning: &HostTuning) -> Self {
        let cap_bps = cap_bps.max(1);
        let min_bps = tuning.min_bitrate_bps.min(cap_bps);
        let max_fps = max_fps.max(1);
        Self {
            cap_bps,
            min_bps,
            current_bps: initial_bps.clamp(min_bps, cap_bps),
            max_fps,
            current_fps: max_fps,
            manual: false,
            backoff_loss_rate: tuning.backoff_loss_rate,
            backoff_nack_count: tuning.backoff_nack_count,
            backoff_ratio: tuning.backoff_ratio.clamp(0.1, 1.0),
            probe_ratio: tuning.probe_ratio.max(1.0),
        }
    }

    pub fn current_bps(&self) -> u64 {
        self.current_bps
    }

    pub fn current_fps(&self) -> u32 {
        self.current_fps
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    fn clamp_bps(&self, bps: u64) -> u64 {
        bps.clamp(self.min_bps, self.cap_bps)
    }

    /// Apply a client reconfigure request. Returns the patch to hand to
    /// the encoder, or `None` if nothing changes.
    pub fn handle_reconfigure(&mut self, msg: &ReconfigureEncoder) -> Option<ReconfigureRequest> {
        match msg.trigger {
            Some(ReconfigureTrigger::TurnOffAuto) => self.manual = true,
            Some(ReconfigureTrigger::TurnOnAuto) => self.manual = false,
            None if self.manual => {
                debug!("automatic reconfigure ignored in manual bitrate mode");
                return None;
            }
            None => {}
        }

        let requested = msg.request();
        let mut patch = ReconfigureRequest::default();
        if let Some(bps) = requested.bitrate_bps {
            let bps = self.clamp_bps(bps);
            if bps != self.current_bps {
                self.current_bps = bps;
                patch.bitrate_bps = Some(bps);
            }
        }
        if let Some(fps) = requested.fps {
            let fps = fps.clamp(1, self.max_fps);
            if fps != self.current_fps {
                self.current_fps = fps;
                patch.fps = Some(fps);
            }
        }

        (!patch.is_empty()).then_some(patch)
    }

    /// Adjust the bitrate from transport feedback. Ignored while manual.
    pub fn on_network_changed(&mut self, stat: &SendSideStat) -> Option<ReconfigureRequest> {
        if self.manual {
            return None;
        }

        let current = self.current_bps as f64;
        let congested =
            stat.loss_rate > self.backoff_loss_rate || stat.nack > self.backoff_nack_count;
        let scaled = if congested {
            current * self.backoff_ratio as f64
        } else if stat.bwe_bps as f64 > current * self.probe_ratio as f64 {
            current * self.probe_ratio as f64
        } else {
            current
        };
        let mut target = scaled as u64;
        if stat.bwe_bps > 0 {
            target = target.min(stat.bwe_bps);
        }
        let target = self.clamp_bps(target);

        if target == self.current_bps {
            return None;
        }
        debug!(
            from = self.current_bps,
            to = target,
            loss = stat.loss_rate,
            nack = stat.nack,
            bwe = stat.bwe_bps,
            "bitrate adjusted"
        );
        self.current_bps = target;
        Some(ReconfigureRequest {
            bitrate_bps: Some(target),
            fps: None,
        })
    }
}
