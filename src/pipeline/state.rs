//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// `Live` and `Frozen` are picked per iteration from the streaming flag.
/// `Error` and `ShuttingDown` both lead to `Stopped`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Session built, loop not entered yet
    Init,

    /// Transmitting freshly captured frames
    Live {
        /// When the pipeline last went live
        since: Instant,
    },

    /// Retransmitting the retained frame
    Frozen {
        /// When the pipeline was frozen
        since: Instant,
    },

    /// A fatal failure ended the loop
    Error,

    /// `running` went false, loop exited normally
    ShuttingDown,

    /// Session flushed and released
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Stopped, _) => false,

            (Init, Live { .. } | Frozen { .. } | Error | ShuttingDown) => true,

            (Live { .. }, Frozen { .. }) => true,
            (Frozen { .. }, Live { .. }) => true,
            (Live { .. } | Frozen { .. }, Error | ShuttingDown) => true,

            (Error | ShuttingDown, Stopped) => true,

            (a, b) if a == b => true,
            (Live { .. }, Live { .. }) | (Frozen { .. }, Frozen { .. }) => true,

            _ => false,
        }
    }

    /// State for an iteration given the streaming flag.
    pub fn running(streaming: bool) -> Self {
        let since = Instant::now();
        if streaming {
            PipelineState::Live { since }
        } else {
            PipelineState::Frozen { since }
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Init => "Init",
            PipelineState::Live { .. } => "Running (live)",
            PipelineState::Frozen { .. } => "Running (frozen)",
            PipelineState::Error => "Error",
            PipelineState::ShuttingDown => "Shutting down",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// True for both variants of the same running mode regardless of `since`.
    pub fn same_mode(&self, other: &PipelineState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
