use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable machine-readable explanation attached to every denial and failure.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Policy denials
    RepoNotAllowlisted,
    OperationDenylisted,
    UnknownOperation,
    MissingWriteToken,
    AuthContextDenied,
    // State machine
    InvalidTransition,
    NotClaimed,
    NotFound,
    // Transient
    UpstreamUnavailable,
    RateLimited,
    // Permanent
    ValidationFailed,
    BudgetExceeded,
    WallTimeExceeded,
    ToolNotAllowed,
    CredentialForbidden,
    UnknownAdapter,
    AdapterRejected,
    // Exhaustion / lifecycle
    RetryBudgetExhausted,
    LeaseExpired,
    Cancelled,
    Superseded,
    InternalError,
}

/// Coarse grouping used for reporting and retry decisions.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReasonClass {
    PolicyDenial,
    InvalidTransition,
    NotClaimed,
    Lookup,
    Transient,
    Permanent,
    Exhausted,
    Lifecycle,
    Internal,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 22] = [
        ReasonCode::RepoNotAllowlisted,
        ReasonCode::OperationDenylisted,
        ReasonCode::UnknownOperation,
        ReasonCode::MissingWriteToken,
        ReasonCode::AuthContextDenied,
        ReasonCode::InvalidTransition,
        ReasonCode::NotClaimed,
        ReasonCode::NotFound,
        ReasonCode::UpstreamUnavailable,
        ReasonCode::RateLimited,
        ReasonCode::ValidationFailed,
        ReasonCode::BudgetExceeded,
        ReasonCode::WallTimeExceeded,
        ReasonCode::ToolNotAllowed,
        ReasonCode::CredentialForbidden,
        ReasonCode::UnknownAdapter,
        ReasonCode::AdapterRejected,
        ReasonCode::RetryBudgetExhausted,
        ReasonCode::LeaseExpired,
        ReasonCode::Cancelled,
        ReasonCode::Superseded,
        ReasonCode::InternalError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RepoNotAllowlisted => "repo_not_allowlisted",
            ReasonCode::OperationDenylisted => "operation_denylisted",
            ReasonCode::UnknownOperation => "unknown_operation",
            ReasonCode::MissingWriteToken => "missing_write_token",
            ReasonCode::AuthContextDenied => "auth_context_denied",
            ReasonCode::InvalidTransition => "invalid_transition",
            ReasonCode::NotClaimed => "not_claimed",
            ReasonCode::NotFound => "not_found",
            ReasonCode::UpstreamUnavailable => "upstream_unavailable",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::ValidationFailed => "validation_failed",
            ReasonCode::BudgetExceeded => "budget_exceeded",
            ReasonCode::WallTimeExceeded => "wall_time_exceeded",
            ReasonCode::ToolNotAllowed => "tool_not_allowed",
            ReasonCode::CredentialForbidden => "credential_forbidden",
            ReasonCode::UnknownAdapter => "unknown_adapter",
            ReasonCode::AdapterRejected => "adapter_rejected",
            ReasonCode::RetryBudgetExhausted => "retry_budget_exhausted",
            ReasonCode::LeaseExpired => "lease_expired",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::Superseded => "superseded",
            ReasonCode::InternalError => "internal_error",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|c| c.as_str() == normalized)
    }

    pub fn class(&self) -> ReasonClass {
        match self {
            ReasonCode::RepoNotAllowlisted
            | ReasonCode::OperationDenylisted
            | ReasonCode::UnknownOperation
            | ReasonCode::MissingWriteToken
            | ReasonCode::AuthContextDenied => ReasonClass::PolicyDenial,
            ReasonCode::InvalidTransition => ReasonClass::InvalidTransition,
            ReasonCode::NotClaimed => ReasonClass::NotClaimed,
            ReasonCode::NotFound => ReasonClass::Lookup,
            ReasonCode::UpstreamUnavailable | ReasonCode::RateLimited => ReasonClass::Transient,
            ReasonCode::ValidationFailed
            | ReasonCode::BudgetExceeded
            | ReasonCode::WallTimeExceeded
            | ReasonCode::ToolNotAllowed
            | ReasonCode::CredentialForbidden
            | ReasonCode::UnknownAdapter
            | ReasonCode::AdapterRejected => ReasonClass::Permanent,
            ReasonCode::RetryBudgetExhausted => ReasonClass::Exhausted,
            ReasonCode::LeaseExpired | ReasonCode::Cancelled | ReasonCode::Superseded => {
                ReasonClass::Lifecycle
            }
            ReasonCode::InternalError => ReasonClass::Internal,
        }
    }

    /// Only transient upstream failures may consume retry budget.
    pub fn is_retryable(&self) -> bool {
        self.class() == ReasonClass::Transient
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
