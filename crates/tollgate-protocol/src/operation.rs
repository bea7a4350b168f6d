use serde::{Deserialize, Serialize};
use std::fmt;

/// External mutation kinds a changeset may carry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateIssue,
    UpdateIssueTitle,
    UpdateIssueBody,
    AddLabels,
    RemoveLabels,
    SetParent,
    AddDependency,
    RemoveDependency,
    AddToProject,
    SetProjectField,
    ProposeAgentRun,
}

/// Apply-order buckets. Declaration order is apply order: later buckets may
/// reference bindings produced by earlier ones.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Create,
    Update,
    Relationship,
    ProjectField,
    Other,
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Operation::CreateIssue,
        Operation::UpdateIssueTitle,
        Operation::UpdateIssueBody,
        Operation::AddLabels,
        Operation::RemoveLabels,
        Operation::SetParent,
        Operation::AddDependency,
        Operation::RemoveDependency,
        Operation::AddToProject,
        Operation::SetProjectField,
        Operation::ProposeAgentRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateIssue => "create_issue",
            Operation::UpdateIssueTitle => "update_issue_title",
            Operation::UpdateIssueBody => "update_issue_body",
            Operation::AddLabels => "add_labels",
            Operation::RemoveLabels => "remove_labels",
            Operation::SetParent => "set_parent",
            Operation::AddDependency => "add_dependency",
            Operation::RemoveDependency => "remove_dependency",
            Operation::AddToProject => "add_to_project",
            Operation::SetProjectField => "set_project_field",
            Operation::ProposeAgentRun => "propose_agent_run",
        }
    }

    /// Strict parse; unknown slugs return `None` so callers can default-deny.
    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == normalized)
    }

    pub fn category(&self) -> OperationCategory {
        match self {
            Operation::CreateIssue => OperationCategory::Create,
            Operation::UpdateIssueTitle
            | Operation::UpdateIssueBody
            | Operation::AddLabels
            | Operation::RemoveLabels => OperationCategory::Update,
            Operation::SetParent | Operation::AddDependency | Operation::RemoveDependency => {
                OperationCategory::Relationship
            }
            Operation::AddToProject | Operation::SetProjectField => {
                OperationCategory::ProjectField
            }
            Operation::ProposeAgentRun => OperationCategory::Other,
        }
    }

    /// Whether the operation writes to the system of record.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Operation::ProposeAgentRun)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OperationCategory {
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Create => "create",
            OperationCategory::Update => "update",
            OperationCategory::Relationship => "relationship",
            OperationCategory::ProjectField => "project_field",
            OperationCategory::Other => "other",
        }
    }
}
