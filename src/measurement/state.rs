//! Measurement job lifecycle.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a measurement job.
///
/// # State Machine
///
/// ```text
/// Created ──> Validating ──> Running <──> Retrying
///                 │             │            │
///                 ▼             ▼            ▼
///               Failed   {Completed | Failed | Cancelled}
/// ```
///
/// Transitions only move forward. The single exception is the pair
/// `Running <-> Retrying`, entered while a worker retries a transient device
/// fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet checked.
    Created,
    /// Preconditions are being checked. No device I/O happens here.
    Validating,
    /// Acquiring.
    Running,
    /// A worker is retrying a transient device fault.
    Retrying,
    /// Finished normally, by limit or by `stop`.
    Completed,
    /// Finished with an error cause.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Created => "Created",
            JobState::Validating => "Validating",
            JobState::Running => "Running",
            JobState::Retrying => "Retrying",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl JobState {
    /// Whether the job has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the job is acquiring (possibly retrying).
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Retrying)
    }

    /// Check if the state allows a transition to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, Running)
                | (Validating, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Running | Retrying, Completed | Failed | Cancelled)
        )
    }

    /// Move to `next`, or fail with `InvalidState` for an illegal transition.
    pub fn transition(&mut self, next: JobState) -> AppResult<()> {
        if !self.can_transition_to(next) {
            return Err(DaqError::InvalidState(format!(
                "illegal job transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}
