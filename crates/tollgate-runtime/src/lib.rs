use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tollgate_protocol::{Budgets, Operation, ReasonCode};

mod manual;
mod provider_stub;

pub use manual::ManualAdapter;
pub use provider_stub::ProviderStubAdapter;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A single external mutation handed to an executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangesetWork {
    pub changeset_id: String,
    pub idempotency_key: String,
    pub operation: Operation,
    pub repo: String,
    pub binding: Option<String>,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Execution context for an agent run. Carries no credentials.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunWork {
    pub run_id: String,
    pub idempotency_key: String,
    pub goal: String,
    pub model: String,
    pub repo: Option<String>,
    pub budgets: Budgets,
    pub tools_allowed: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub attempt: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Changeset(ChangesetWork),
    AgentRun(RunWork),
}

impl WorkItem {
    pub fn entity_id(&self) -> &str {
        match self {
            WorkItem::Changeset(c) => &c.changeset_id,
            WorkItem::AgentRun(r) => &r.run_id,
        }
    }

    pub fn idempotency_key(&self) -> &str {
        match self {
            WorkItem::Changeset(c) => &c.idempotency_key,
            WorkItem::AgentRun(r) => &r.idempotency_key,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            WorkItem::Changeset(c) => c.attempt,
            WorkItem::AgentRun(r) => r.attempt,
        }
    }
}

/// Handle to a submitted job plus the work it was submitted for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub item: WorkItem,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: String,
    pub state: JobState,
}

/// Cumulative resource consumption reported by an executor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub total_tokens: u64,
    pub tool_calls: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollReport {
    pub state: JobState,
    #[serde(default)]
    pub reason_code: Option<ReasonCode>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    /// Tools the job wants to invoke next. The caller decides whether the
    /// job may proceed.
    #[serde(default)]
    pub requested_tools: Vec<String>,
    /// Result binding (e.g. created issue number) for changeset work.
    #[serde(default)]
    pub binding: Option<String>,
}

impl PollReport {
    pub fn state(state: JobState) -> Self {
        Self {
            state,
            reason_code: None,
            message: None,
            usage: Usage::default(),
            requested_tools: Vec::new(),
            binding: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelReport {
    pub state: JobState,
    #[serde(default)]
    pub reason_code: Option<ReasonCode>,
}

/// Executor failures, expressed in the shared reason-code taxonomy so the
/// engine never inspects adapter-specific error shapes.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("upstream unavailable (status {status})")]
    Unavailable {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("rejected by executor: {0}")]
    Rejected(String),
}

impl AdapterError {
    /// Map an upstream HTTP status onto the taxonomy.
    pub fn from_http_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            429 => AdapterError::RateLimited { retry_after },
            500..=599 => AdapterError::Unavailable {
                status,
                retry_after,
            },
            400 | 404 | 409 | 422 => AdapterError::Validation(format!("{status}: {body}")),
            _ => AdapterError::Rejected(format!("{status}: {body}")),
        }
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            AdapterError::Unavailable { .. } => ReasonCode::UpstreamUnavailable,
            AdapterError::RateLimited { .. } => ReasonCode::RateLimited,
            AdapterError::Validation(_) => ReasonCode::ValidationFailed,
            AdapterError::ToolNotAllowed(_) => ReasonCode::ToolNotAllowed,
            AdapterError::BudgetExceeded(_) => ReasonCode::BudgetExceeded,
            AdapterError::Rejected(_) => ReasonCode::AdapterRejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.reason_code().is_retryable()
    }

    /// Server-requested minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdapterError::Unavailable { retry_after, .. }
            | AdapterError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait::async_trait]
pub trait ExecutorAdapter: Send + Sync {
    /// Registry name, persisted as `adapter_name`.
    fn name(&self) -> &str;

    async fn submit(&self, item: &WorkItem) -> Result<Submission, AdapterError>;

    async fn poll(&self, job: &Job) -> Result<PollReport, AdapterError>;

    async fn fetch_artifacts(&self, job: &Job) -> Result<Vec<String>, AdapterError>;

    async fn cancel(&self, job: &Job) -> Result<CancelReport, AdapterError>;
}

pub type SharedAdapter = Arc<dyn ExecutorAdapter>;

/// Built-in executors selectable by name in configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Manual,
    ProviderStub,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 2] = [AdapterKind::Manual, AdapterKind::ProviderStub];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Manual => "manual",
            AdapterKind::ProviderStub => "provider_stub",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|k| k.as_str() == normalized)
    }

    pub fn build(&self) -> SharedAdapter {
        match self {
            AdapterKind::Manual => Arc::new(ManualAdapter),
            AdapterKind::ProviderStub => Arc::new(ProviderStubAdapter::default()),
        }
    }
}

/// Adapters available to the engine, fixed at construction.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, SharedAdapter>,
}

impl AdapterRegistry {
    pub fn from_kinds(kinds: &[AdapterKind]) -> Self {
        let mut reg = Self::default();
        for kind in kinds {
            reg.register(kind.build());
        }
        reg
    }

    pub fn register(&mut self, adapter: SharedAdapter) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<SharedAdapter> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_onto_reason_codes() {
        let e = AdapterError::from_http_status(503, Some(Duration::from_secs(2)), "down");
        assert_eq!(e.reason_code(), ReasonCode::UpstreamUnavailable);
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));

        let e = AdapterError::from_http_status(429, None, "slow down");
        assert_eq!(e.reason_code(), ReasonCode::RateLimited);
        assert!(e.is_retryable());

        let e = AdapterError::from_http_status(422, None, "bad label");
        assert_eq!(e.reason_code(), ReasonCode::ValidationFailed);
        assert!(!e.is_retryable());

        let e = AdapterError::from_http_status(403, None, "forbidden");
        assert_eq!(e.reason_code(), ReasonCode::AdapterRejected);
    }

    #[test]
    fn adapter_kinds_resolve_by_name() {
        assert_eq!(AdapterKind::from_slug("Provider_Stub"), Some(AdapterKind::ProviderStub));
        assert_eq!(AdapterKind::from_slug("github"), None);
        let reg = AdapterRegistry::from_kinds(&AdapterKind::ALL);
        assert_eq!(reg.names(), vec!["manual", "provider_stub"]);
        assert!(reg.get("manual").is_some());
    }

    #[test]
    fn job_state_finished_set() {
        assert!(JobState::Succeeded.is_finished());
        assert!(JobState::Cancelled.is_finished());
        assert!(!JobState::Queued.is_finished());
        assert!(!JobState::Running.is_finished());
    }
}
