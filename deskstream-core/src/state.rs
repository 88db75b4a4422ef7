//! Pipeline lifecycle shared by the host and client pipelines.
//!
//! ```text
//!  Created ──start()──► Running ──stop()──► Stopped
//!     │                                       ▲
//!     └──────────────stop()───────────────────┘
//! ```
//!
//! `Stopped` is terminal. There is no paused state: a pipeline that
//! must change parameters is destroyed and a new one is created.

use crate::error::StreamError;

/// Lifecycle phase of one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl PipelineState {
    /// Transition `Created → Running`.
    pub fn start(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Created => {
                *self = Self::Running;
                Ok(())
            }
            Self::Running => Err(StreamError::InvalidState("pipeline already running")),
            Self::Stopped => Err(StreamError::InvalidState("a stopped pipeline is never resumed")),
        }
    }

    /// Transition to `Stopped`. Returns `false` if already stopped.
    pub fn stop(&mut self) -> bool {
        let was_stopped = *self == Self::Stopped;
        *self = Self::Stopped;
        !was_stopped
    }

    pub fn is_running(&self) -> bool {
        *self == Self::Running
    }
}
