//! Frame-pacing handoff between the decode and render threads.
//!
//! `CtSmoother` holds at most one decoded frame; a newer push replaces
//! an unconsumed older one. Callers serialise access with the client
//! pipeline's render lock.

use crate::media::types::ResourceId;

/// A decoded frame waiting for the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmoothedFrame {
    pub resource: ResourceId,
    pub capture_ts_us: u64,
    pub arrival_ts_us: u64,
}

/// Single-slot, latest-frame-wins buffer.
#[derive(Debug, Default)]
pub struct CtSmoother {
    slot: Option<SmoothedFrame>,
    pushed: u64,
    dropped: u64,
}

impl CtSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, discarding any frame not yet consumed.
    pub fn push(&mut self, frame: SmoothedFrame) {
        if self.slot.replace(frame).is_some() {
            self.dropped += 1;
        }
        self.pushed += 1;
    }

    /// The newest frame that had arrived by `at_time_us`, without
    /// removing it.
    pub fn get(&self, at_time_us: u64) -> Option<SmoothedFrame> {
        self.slot.filter(|f| f.arrival_ts_us <= at_time_us)
    }

    /// Remove and return the held frame.
    pub fn pop(&mut self) -> Option<SmoothedFrame> {
        self.slot.take()
    }

    pub fn size(&self) -> usize {
        usize::from(self.slot.is_some())
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Frames replaced before the render thread consumed them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
