//! Capture-rate throttling.
//!
//! Displays often refresh faster than the negotiated frame rate. The
//! throttle keeps a rolling one-second history of capture timestamps;
//! once the observed rate exceeds `target + hysteresis`, wall-clock
//! time is cut into windows of `1 / target` seconds and at most one
//! frame per window is encoded. Windows are derived from the timestamp
//! itself, so no rounding error accumulates over time.

use std::collections::VecDeque;

const WINDOW_US: u64 = 1_000_000;

/// Decides which captured frames are worth encoding.
#[derive(Debug, Clone)]
pub struct FpsThrottle {
    target_fps: u32,
    hysteresis: u32,
    history: VecDeque<u64>,
    last_window: Option<u64>,
}

impl FpsThrottle {
    pub fn new(target_fps: u32, hysteresis: u32) -> Self {
        Self {
            target_fps: target_fps.max(1),
            hysteresis,
            history: VecDeque::with_capacity(256),
            last_window: None,
        }
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn set_target_fps(&mut self, fps: u32) {
        self.target_fps = fps.max(1);
    }

    /// Frames captured within the last second.
    pub fn observed_fps(&self) -> usize {
        self.history.len()
    }

    /// Record a capture at `ts_us` and decide whether to encode it.
    pub fn should_encode_frame(&mut self, ts_us: u64) -> bool {
        self.history.push_back(ts_us);
        while let Some(&oldest) = self.history.front() {
            if oldest + WINDOW_US <= ts_us {
                self.history.pop_front();
            } else {
                break;
            }
        }

        let window = ts_us / (WINDOW_US / self.target_fps as u64).max(1);
        let limit = (self.target_fps + self.hysteresis) as usize;
        if self.history.len() <= limit {
            self.last_window = Some(window);
            return true;
        }

        match self.last_window {
            Some(last) if window <= last => false,
            _ => {
                self.last_window = Some(window);
                true
            }
        }
    }
}
