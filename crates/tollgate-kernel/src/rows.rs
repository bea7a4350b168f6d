use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tollgate_protocol::{Budgets, ChangesetStatus, Operation, OperationCategory, ReasonCode, RunStatus};

use crate::{parse_json, parse_opt_ts, parse_slug, parse_ts};

pub(crate) const CHANGESET_COLS: &str = "id,bundle_id,idempotency_key,intent_fingerprint,operation,repo,binding,payload,status,requires_approval,created_by,approved_by,approved_at,reason_code,last_error,retry_count,max_retries,next_attempt_at,claimed_by,claim_expires_at,job_id,created_at,updated_at";

pub(crate) const RUN_COLS: &str = "run_id,idempotency_key,intent_fingerprint,goal,model,repo,budgets,tools_allowed,adapter_name,status,status_reason,created_by,approved_by,claimed_by,claim_expires_at,retry_count,max_retries,next_attempt_at,last_error,job_id,artifact_paths,created_at,updated_at,env";

pub(crate) const AUDIT_COLS: &str =
    "id,event_type,run_id,changeset_id,actor,repo,reason_code,payload,created_at";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChangesetRow {
    pub id: String,
    pub bundle_id: Option<String>,
    pub idempotency_key: String,
    pub intent_fingerprint: String,
    pub operation: Operation,
    pub repo: String,
    pub binding: Option<String>,
    pub payload: Value,
    pub status: ChangesetStatus,
    pub requires_approval: bool,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub reason_code: Option<ReasonCode>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangesetRow {
    pub fn category(&self) -> OperationCategory {
        self.operation.category()
    }

    /// Whether `worker_id` holds an unexpired lease at `now`.
    pub fn is_held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
            && self.claim_expires_at.map(|t| t > now).unwrap_or(false)
    }

    pub(crate) fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let operation: String = r.get(4)?;
        let payload: String = r.get(7)?;
        let status: String = r.get(8)?;
        let reason: Option<String> = r.get(13)?;
        let created_at: String = r.get(21)?;
        let updated_at: String = r.get(22)?;
        Ok(Self {
            id: r.get(0)?,
            bundle_id: r.get(1)?,
            idempotency_key: r.get(2)?,
            intent_fingerprint: r.get(3)?,
            operation: parse_slug(4, &operation, Operation::from_slug)?,
            repo: r.get(5)?,
            binding: r.get(6)?,
            payload: parse_json(7, &payload)?,
            status: parse_slug(8, &status, ChangesetStatus::from_slug)?,
            requires_approval: r.get::<_, i64>(9)? != 0,
            created_by: r.get(10)?,
            approved_by: r.get(11)?,
            approved_at: parse_opt_ts(12, r.get(12)?)?,
            reason_code: reason
                .map(|s| parse_slug(13, &s, ReasonCode::from_slug))
                .transpose()?,
            last_error: r.get(14)?,
            retry_count: r.get(15)?,
            max_retries: r.get(16)?,
            next_attempt_at: parse_opt_ts(17, r.get(17)?)?,
            claimed_by: r.get(18)?,
            claim_expires_at: parse_opt_ts(19, r.get(19)?)?,
            job_id: r.get(20)?,
            created_at: parse_ts(21, &created_at)?,
            updated_at: parse_ts(22, &updated_at)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentRunRow {
    pub run_id: String,
    pub idempotency_key: String,
    pub intent_fingerprint: String,
    pub goal: String,
    pub model: String,
    pub repo: Option<String>,
    pub budgets: Budgets,
    pub tools_allowed: Vec<String>,
    pub adapter_name: String,
    pub status: RunStatus,
    pub status_reason: Option<ReasonCode>,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub job_id: Option<String>,
    pub artifact_paths: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRunRow {
    /// Whether `worker_id` holds an unexpired lease at `now`.
    pub fn is_held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
            && self.claim_expires_at.map(|t| t > now).unwrap_or(false)
    }

    pub(crate) fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let budgets: String = r.get(6)?;
        let tools: String = r.get(7)?;
        let status: String = r.get(9)?;
        let reason: Option<String> = r.get(10)?;
        let artifacts: String = r.get(20)?;
        let created_at: String = r.get(21)?;
        let updated_at: String = r.get(22)?;
        let env: String = r.get(23)?;
        Ok(Self {
            run_id: r.get(0)?,
            idempotency_key: r.get(1)?,
            intent_fingerprint: r.get(2)?,
            goal: r.get(3)?,
            model: r.get(4)?,
            repo: r.get(5)?,
            budgets: parse_json(6, &budgets)?,
            tools_allowed: parse_json(7, &tools)?,
            adapter_name: r.get(8)?,
            status: parse_slug(9, &status, RunStatus::from_slug)?,
            status_reason: reason
                .map(|s| parse_slug(10, &s, ReasonCode::from_slug))
                .transpose()?,
            created_by: r.get(11)?,
            approved_by: r.get(12)?,
            claimed_by: r.get(13)?,
            claim_expires_at: parse_opt_ts(14, r.get(14)?)?,
            retry_count: r.get(15)?,
            max_retries: r.get(16)?,
            next_attempt_at: parse_opt_ts(17, r.get(17)?)?,
            last_error: r.get(18)?,
            job_id: r.get(19)?,
            artifact_paths: parse_json(20, &artifacts)?,
            env: parse_json(23, &env)?,
            created_at: parse_ts(21, &created_at)?,
            updated_at: parse_ts(22, &updated_at)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changeset_id: Option<String>,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub(crate) fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = r.get(7)?;
        let created_at: String = r.get(8)?;
        Ok(Self {
            id: r.get(0)?,
            event_type: r.get(1)?,
            run_id: r.get(2)?,
            changeset_id: r.get(3)?,
            actor: r.get(4)?,
            repo: r.get(5)?,
            reason_code: r.get(6)?,
            payload: parse_json(7, &payload)?,
            created_at: parse_ts(8, &created_at)?,
        })
    }

    /// Status this event moved its entity to, if it was a transition.
    pub fn to_status(&self) -> Option<&str> {
        self.payload.get("to").and_then(Value::as_str)
    }
}

/// Audit event to append. Entity ids and repo are filled in by transitions.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEvent {
    pub event_type: &'static str,
    pub actor: String,
    pub run_id: Option<String>,
    pub changeset_id: Option<String>,
    pub repo: Option<String>,
    pub reason_code: Option<ReasonCode>,
    pub payload: Value,
}

impl NewAuditEvent {
    pub fn new(event_type: &'static str, actor: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: actor.into(),
            payload: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn reason(mut self, code: ReasonCode) -> Self {
        self.reason_code = Some(code);
        self
    }

    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn changeset(mut self, id: impl Into<String>) -> Self {
        self.changeset_id = Some(id.into());
        self
    }

    pub fn repo(mut self, repo: Option<String>) -> Self {
        self.repo = repo;
        self
    }

    /// Merge `fields` into the payload object.
    pub fn with(mut self, fields: Value) -> Self {
        if let (Value::Object(dst), Value::Object(src)) = (&mut self.payload, fields) {
            dst.extend(src);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewChangeset {
    pub id: String,
    pub bundle_id: Option<String>,
    pub idempotency_key: String,
    pub intent_fingerprint: String,
    pub operation: Operation,
    pub repo: String,
    pub binding: Option<String>,
    pub payload: Value,
    pub requires_approval: bool,
    pub created_by: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct NewAgentRun {
    pub run_id: String,
    pub idempotency_key: String,
    pub intent_fingerprint: String,
    pub goal: String,
    pub model: String,
    pub repo: Option<String>,
    pub budgets: Budgets,
    pub tools_allowed: Vec<String>,
    pub adapter_name: String,
    pub env: BTreeMap<String, String>,
    pub created_by: String,
    pub max_retries: u32,
}

/// Column changes applied alongside a status transition. `None` leaves a
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct ChangesetPatch {
    /// Sets `approved_by` and stamps `approved_at`.
    pub approved_by: Option<String>,
    /// `Some(None)` clears the column.
    pub reason_code: Option<Option<ReasonCode>>,
    pub last_error: Option<String>,
    pub retry_count: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    /// Reference produced by the executor, e.g. the created issue.
    pub binding: Option<String>,
    pub release_lease: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub approved_by: Option<String>,
    /// `Some(None)` clears the column.
    pub status_reason: Option<Option<ReasonCode>>,
    pub last_error: Option<String>,
    pub retry_count: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub job_id: Option<String>,
    pub artifact_paths: Option<Vec<String>>,
    pub release_lease: bool,
}

/// Lease condition a transition must satisfy in addition to its status check.
#[derive(Debug, Clone)]
pub enum LeaseGuard {
    None,
    /// `worker_id` holds a lease that is still valid at `now`.
    Live { worker_id: String, now: DateTime<Utc> },
    /// `worker_id` held a lease that has lapsed by `now`.
    Expired { worker_id: String, now: DateTime<Utc> },
}

impl LeaseGuard {
    pub(crate) fn admits(
        &self,
        claimed_by: Option<&str>,
        claim_expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        match self {
            LeaseGuard::None => true,
            LeaseGuard::Live { worker_id, now } => {
                claimed_by == Some(worker_id.as_str())
                    && claim_expires_at.map(|t| t > *now).unwrap_or(false)
            }
            LeaseGuard::Expired { worker_id, now } => {
                claimed_by == Some(worker_id.as_str())
                    && claim_expires_at.map(|t| t <= *now).unwrap_or(false)
            }
        }
    }
}

/// A committed value together with the audit rows its transaction appended.
#[derive(Debug, Clone)]
pub struct Recorded<T> {
    pub value: T,
    pub events: Vec<AuditEvent>,
}

/// Outcome of a guarded transition. Only `Done` changed anything.
#[derive(Debug, Clone)]
pub enum Transition<T> {
    Done(Recorded<T>),
    NotFound,
    /// Current status is not a legal source for the requested target.
    WrongState(T),
    /// Status matched but the lease guard did not.
    NotHeld(T),
}

#[derive(Debug, Clone)]
pub struct ProposeResult<T> {
    pub recorded: Recorded<T>,
    pub resolution: crate::Resolution,
}
