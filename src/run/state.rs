//! Pure run state machine
//!
//! ```text
//! started ──> listing ──> enriching ──> merging ──> completed
//!    │           │          │  ^  │         │
//!    │           │          └──┘  │         │
//!    └─────┬─────┴────────────────┴─────────┘
//!          v
//!   failed / discarded
//! ```
//!
//! `enriching` may re-enter itself when a run resumes from its checkpoint. A
//! `failed` run resumes into `enriching` or `merging` depending on which
//! artifacts survived, or is `discarded` if it never produced a roster.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    Listing,
    Enriching,
    Merging,
    Completed,
    Failed,
    Discarded,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Listing => "listing",
            Self::Enriching => "enriching",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded)
    }

    /// A later invocation may pick this run up again
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Listing | Self::Enriching | Self::Merging | Self::Failed
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline phase in which a run-level error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Listing,
    Enriching,
    Merging,
}

impl RunPhase {
    pub fn state(&self) -> RunState {
        match self {
            Self::Listing => RunState::Listing,
            Self::Enriching => RunState::Enriching,
            Self::Merging => RunState::Merging,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid run transition from {from} to {to}")]
    Invalid { from: RunState, to: RunState },
}

/// Pure: validate a run state transition
pub fn transition(from: RunState, to: RunState) -> Result<RunState, TransitionError> {
    use RunState::*;

    let allowed = match (from, to) {
        (Started, Listing)
        | (Listing, Enriching)
        | (Enriching, Enriching)
        | (Enriching, Merging)
        | (Merging, Completed) => true,

        // Resume
        (Failed, Enriching) | (Failed, Merging) => true,

        (Started | Listing | Enriching | Merging, Failed) => true,
        (Started | Listing | Enriching | Failed, Discarded) => true,

        _ => false,
    };

    if allowed {
        Ok(to)
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = RunState::Started;
        for next in [
            RunState::Listing,
            RunState::Enriching,
            RunState::Merging,
            RunState::Completed,
        ] {
            state = transition(state, next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_enriching_reenters_on_resume() {
        assert_eq!(
            transition(RunState::Enriching, RunState::Enriching),
            Ok(RunState::Enriching)
        );
        assert!(transition(RunState::Failed, RunState::Enriching).is_ok());
        assert!(transition(RunState::Failed, RunState::Merging).is_ok());
    }

    #[test]
    fn test_discard_only_before_merging() {
        assert!(transition(RunState::Listing, RunState::Discarded).is_ok());
        assert!(transition(RunState::Enriching, RunState::Discarded).is_ok());
        assert!(transition(RunState::Merging, RunState::Discarded).is_err());
        assert!(transition(RunState::Completed, RunState::Discarded).is_err());
    }

    #[test]
    fn test_completed_is_final() {
        let err = transition(RunState::Completed, RunState::Failed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid run transition from completed to failed"
        );
        assert!(transition(RunState::Listing, RunState::Merging).is_err());
    }

    #[test]
    fn test_phase_display_is_lowercase() {
        assert_eq!(RunPhase::Merging.to_string(), "merging");
        assert_eq!(RunPhase::Listing.state(), RunState::Listing);
    }
}
