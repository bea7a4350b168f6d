//! Shared vocabulary for the tollgate orchestrator.
//!
//! Status sets, operation kinds and reason codes are persisted and surfaced
//! verbatim to callers, so their string forms are part of the wire contract.

use serde::{Deserialize, Serialize};

mod operation;
mod reason;
mod status;

pub use operation::{Operation, OperationCategory};
pub use reason::{ReasonClass, ReasonCode};
pub use status::{ChangesetStatus, RunStatus};

/// Resource ceilings for a single agent run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Budgets {
    pub max_total_tokens: u64,
    pub max_tool_calls: u32,
    pub max_wall_seconds: u64,
}

impl Budgets {
    /// Every ceiling must be positive and no larger than `ceiling`'s.
    pub fn within(&self, ceiling: &Budgets) -> bool {
        self.max_total_tokens > 0
            && self.max_tool_calls > 0
            && self.max_wall_seconds > 0
            && self.max_total_tokens <= ceiling.max_total_tokens
            && self.max_tool_calls <= ceiling.max_tool_calls
            && self.max_wall_seconds <= ceiling.max_wall_seconds
    }
}

/// Offset pagination envelope.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_offset: Option<u64>,
}

impl<T> Page<T> {
    /// Builds a page; `next_offset` is set only when the page came back full.
    pub fn from_items(items: Vec<T>, offset: u64, limit: u64) -> Self {
        let next_offset = if limit > 0 && items.len() as u64 == limit {
            Some(offset + limit)
        } else {
            None
        };
        Self { items, next_offset }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_slugs_round_trip_and_reject_unknown() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_slug(op.as_str()), Some(op));
        }
        assert_eq!(
            Operation::from_slug(" Create_Issue "),
            Some(Operation::CreateIssue)
        );
        assert_eq!(Operation::from_slug("delete_repo"), None);
    }

    #[test]
    fn categories_order_creates_before_project_fields() {
        let mut ops = vec![
            Operation::SetProjectField,
            Operation::AddDependency,
            Operation::UpdateIssueTitle,
            Operation::CreateIssue,
        ];
        ops.sort_by_key(|op| op.category());
        assert_eq!(
            ops,
            vec![
                Operation::CreateIssue,
                Operation::UpdateIssueTitle,
                Operation::AddDependency,
                Operation::SetProjectField,
            ]
        );
        assert!(OperationCategory::Create.rank() < OperationCategory::Other.rank());
    }

    #[test]
    fn run_transitions_follow_lifecycle_table() {
        use RunStatus::*;
        assert!(Proposed.can_transition_to(Approved));
        assert!(Running.can_transition_to(Approved));
        assert!(Failed.can_transition_to(Approved));
        assert!(!Completed.can_transition_to(Approved));
        assert!(!Proposed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert_eq!(RunStatus::sources_for(Running), vec![Approved]);
        for status in RunStatus::ALL {
            if status.is_terminal() {
                assert!(RunStatus::ALL.iter().all(|to| !status.can_transition_to(*to)));
            }
        }
    }

    #[test]
    fn changeset_terminal_states_only_lead_to_supersession() {
        for status in ChangesetStatus::ALL {
            if status.is_terminal() {
                for to in ChangesetStatus::ALL {
                    if status.can_transition_to(to) {
                        assert_eq!(to, ChangesetStatus::Superseded);
                        assert!(status.is_terminal_failure());
                    }
                }
            }
        }
        assert!(!ChangesetStatus::Applied.can_transition_to(ChangesetStatus::Approved));
        assert_eq!(
            ChangesetStatus::from_slug("dead_lettered"),
            Some(ChangesetStatus::DeadLettered)
        );
    }

    #[test]
    fn only_transient_reasons_are_retryable() {
        let retryable: Vec<_> = ReasonCode::ALL
            .iter()
            .filter(|c| c.is_retryable())
            .map(|c| c.as_str())
            .collect();
        assert_eq!(retryable, vec!["upstream_unavailable", "rate_limited"]);
        assert_eq!(
            ReasonCode::from_slug("retry_budget_exhausted"),
            Some(ReasonCode::RetryBudgetExhausted)
        );
        assert_eq!(
            serde_json::to_value(ReasonCode::NotClaimed).unwrap(),
            serde_json::json!("not_claimed")
        );
    }

    #[test]
    fn budgets_must_be_positive_and_under_ceiling() {
        let ceiling = Budgets {
            max_total_tokens: 100_000,
            max_tool_calls: 50,
            max_wall_seconds: 600,
        };
        let ok = Budgets {
            max_total_tokens: 10_000,
            max_tool_calls: 5,
            max_wall_seconds: 60,
        };
        assert!(ok.within(&ceiling));
        assert!(!Budgets {
            max_tool_calls: 0,
            ..ok
        }
        .within(&ceiling));
        assert!(!Budgets {
            max_wall_seconds: 601,
            ..ok
        }
        .within(&ceiling));
    }

    #[test]
    fn page_reports_next_offset_only_when_full() {
        let full = Page::from_items(vec![1, 2], 4, 2);
        assert_eq!(full.next_offset, Some(6));
        let partial = Page::from_items(vec![1], 4, 2);
        assert_eq!(partial.next_offset, None);
    }
}
