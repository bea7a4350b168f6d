use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single proposed external mutation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetStatus {
    Proposed,
    Approved,
    Rejected,
    Applying,
    Applied,
    /// Transient failure with a retry scheduled at `next_attempt_at`.
    Failed,
    DeadLettered,
    Superseded,
}

impl ChangesetStatus {
    pub const ALL: [ChangesetStatus; 8] = [
        ChangesetStatus::Proposed,
        ChangesetStatus::Approved,
        ChangesetStatus::Rejected,
        ChangesetStatus::Applying,
        ChangesetStatus::Applied,
        ChangesetStatus::Failed,
        ChangesetStatus::DeadLettered,
        ChangesetStatus::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetStatus::Proposed => "proposed",
            ChangesetStatus::Approved => "approved",
            ChangesetStatus::Rejected => "rejected",
            ChangesetStatus::Applying => "applying",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
            ChangesetStatus::DeadLettered => "dead_lettered",
            ChangesetStatus::Superseded => "superseded",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|s| s.as_str() == normalized)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangesetStatus::Applied
                | ChangesetStatus::Rejected
                | ChangesetStatus::DeadLettered
                | ChangesetStatus::Superseded
        )
    }

    /// Terminal states that a changed intent may supersede.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ChangesetStatus::Rejected | ChangesetStatus::DeadLettered)
    }

    pub fn can_transition_to(&self, next: ChangesetStatus) -> bool {
        use ChangesetStatus::*;
        matches!(
            (self, next),
            (Proposed, Approved)
                | (Proposed, Rejected)
                | (Approved, Applying)
                | (Approved, Rejected)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Applying, DeadLettered)
                | (Applying, Rejected)
                | (Failed, Applying)
                | (Failed, DeadLettered)
                | (Failed, Rejected)
                | (Rejected, Superseded)
                | (DeadLettered, Superseded)
        )
    }

    pub fn sources_for(to: ChangesetStatus) -> Vec<ChangesetStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single proposed token-spending execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Proposed,
    Approved,
    Rejected,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Proposed,
        RunStatus::Approved,
        RunStatus::Rejected,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Proposed => "proposed",
            RunStatus::Approved => "approved",
            RunStatus::Rejected => "rejected",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|s| s.as_str() == normalized)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Rejected | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Proposed, Approved)
                | (Proposed, Rejected)
                | (Proposed, Cancelled)
                | (Approved, Running)
                | (Approved, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Approved)
                | (Failed, Approved)
                | (Failed, Cancelled)
        )
    }

    /// States `from` for which a transition to `to` is legal.
    pub fn sources_for(to: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
