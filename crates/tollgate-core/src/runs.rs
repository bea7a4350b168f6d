use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tollgate_kernel::{
    fingerprint, AgentRunRow, IdempotencyKey, LeaseGuard, NewAgentRun, NewAuditEvent, Resolution,
    RunPatch, Transition,
};
use tollgate_policy::{ActorContext, ActorKind, Decision};
use tollgate_protocol::{Budgets, Operation, Page, ReasonCode, RunStatus};
use tollgate_runtime::{RunWork, WorkItem};
use tollgate_topics as topics;
use uuid::Uuid;

use crate::execute::{LeaseRef, Limits, Outcome};
use crate::retry::RetryDecision;
use crate::{EngineError, EngineResult, Orchestrator, Proposal};

const ENTITY: &str = "agent_run";

/// Environment keys that would hand a write credential to an agent.
pub const CREDENTIAL_ENV_KEYS: &[&str] = &["GITHUB_TOKEN", "GH_TOKEN"];
const CREDENTIAL_ENV_SUFFIXES: &[&str] = &["_WRITE_TOKEN", "_PAT"];

fn is_credential_key(key: &str) -> bool {
    let upper = key.trim().to_ascii_uppercase();
    CREDENTIAL_ENV_KEYS.contains(&upper.as_str())
        || CREDENTIAL_ENV_SUFFIXES.iter().any(|s| upper.ends_with(s))
}

fn credential_keys(env: &BTreeMap<String, String>) -> Vec<String> {
    env.keys().filter(|k| is_credential_key(k)).cloned().collect()
}

/// A proposed agent execution as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeAgentRun {
    pub goal: String,
    pub model: String,
    #[serde(default)]
    pub repo: Option<String>,
    pub budgets: Budgets,
    #[serde(default)]
    pub tools_allowed: Vec<String>,
    pub adapter_name: String,
    /// Non-secret environment for the execution context.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Orchestrator {
    pub async fn propose_agent_run(
        &self,
        spec: ProposeAgentRun,
        created_by: &ActorContext,
    ) -> EngineResult<Proposal<AgentRunRow>> {
        let op = Operation::ProposeAgentRun.as_str();
        if let Decision::Deny(d) = self.policy().evaluate(op, spec.repo.as_deref(), created_by) {
            let err = EngineError::Denied {
                reason_code: d.reason_code,
                message: d.message,
            };
            return Err(self.refuse_run(&spec, &created_by.actor, err).await);
        }
        if let Err(err) = self.validate_run(&spec) {
            return Err(self.refuse_run(&spec, &created_by.actor, err).await);
        }

        let mut tools = spec.tools_allowed.clone();
        tools.sort();
        tools.dedup();
        let intent = json!({
            "goal": spec.goal,
            "model": spec.model,
            "repo": spec.repo,
            "budgets": spec.budgets,
            "tools_allowed": tools,
            "adapter": spec.adapter_name,
            "env": spec.env,
        });
        let key = match spec.idempotency_key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => IdempotencyKey::explicit(k),
            _ => IdempotencyKey::derive(op, spec.repo.as_deref().unwrap_or("-"), &intent),
        };
        let new = NewAgentRun {
            run_id: Uuid::new_v4().to_string(),
            idempotency_key: key.into_string(),
            intent_fingerprint: fingerprint(&intent),
            goal: spec.goal,
            model: spec.model,
            repo: spec.repo,
            budgets: spec.budgets,
            tools_allowed: tools,
            adapter_name: spec.adapter_name,
            env: spec.env,
            created_by: created_by.actor.clone(),
            max_retries: spec.max_retries.unwrap_or(self.config().retry.max_retries),
        };
        let now = self.now();
        let result = self
            .store(&created_by.actor, move |k| k.propose_run(new, now))
            .await?;
        self.inner.audit.publish(&result.recorded.events);
        let row = result.recorded.value;
        let (deduplicated, superseded) = match result.resolution {
            Resolution::Create => (false, None),
            Resolution::Reuse(_) => (true, None),
            Resolution::Supersede(old) => (false, Some(old)),
        };
        tracing::info!(
            target: "agent_runs",
            run_id = %row.run_id,
            adapter = %row.adapter_name,
            deduplicated,
            "proposed"
        );
        Ok(Proposal {
            entity: row,
            deduplicated,
            superseded,
        })
    }

    /// Apply a human decision to a run. Only `approved`, `rejected` and
    /// `cancelled` are accepted here; the other statuses belong to the lease
    /// manager and retry controller.
    pub async fn transition_agent_run(
        &self,
        run_id: &str,
        to: RunStatus,
        reason_code: Option<ReasonCode>,
        actor: &ActorContext,
    ) -> EngineResult<AgentRunRow> {
        match to {
            RunStatus::Approved => self.approve_agent_run(run_id, actor).await,
            RunStatus::Rejected => self.reject_agent_run(run_id, &actor.actor, reason_code).await,
            RunStatus::Cancelled => self.cancel_agent_run(run_id, &actor.actor).await,
            RunStatus::Running | RunStatus::Completed | RunStatus::Failed | RunStatus::Proposed => {
                let row = self.load_run(run_id, &actor.actor).await?;
                let err = EngineError::InvalidTransition {
                    entity: ENTITY,
                    id: run_id.to_string(),
                    from: row.status.as_str().into(),
                    to: to.as_str().into(),
                };
                Err(self.refuse_run_attempt(&row, &actor.actor, to.as_str(), err).await)
            }
        }
    }

    /// Human approval from `proposed`, or re-approval of a `failed` run,
    /// which restores its retry budget.
    pub async fn approve_agent_run(
        &self,
        run_id: &str,
        approver: &ActorContext,
    ) -> EngineResult<AgentRunRow> {
        if approver.kind != ActorKind::Human || approver.actor.trim().is_empty() {
            let ev = NewAuditEvent::new(topics::AGENT_RUN_DENIED, &approver.actor)
                .run(run_id)
                .reason(ReasonCode::AuthContextDenied)
                .with(json!({ "action": "approve", "actor_kind": approver.kind }));
            self.record(ev).await?;
            return Err(EngineError::Denied {
                reason_code: ReasonCode::AuthContextDenied,
                message: "agent runs can only be approved by a human".into(),
            });
        }
        let row = self
            .move_run(
                run_id,
                vec![RunStatus::Proposed, RunStatus::Failed],
                RunStatus::Approved,
                LeaseGuard::None,
                RunPatch {
                    approved_by: Some(approver.actor.clone()),
                    status_reason: Some(None),
                    retry_count: Some(0),
                    ..Default::default()
                },
                NewAuditEvent::new(topics::AGENT_RUN_APPROVED, &approver.actor),
            )
            .await?;
        tracing::info!(target: "agent_runs", run_id, approver = %approver.actor, "approved");
        Ok(row)
    }

    pub async fn reject_agent_run(
        &self,
        run_id: &str,
        actor: &str,
        reason_code: Option<ReasonCode>,
    ) -> EngineResult<AgentRunRow> {
        let mut event = NewAuditEvent::new(topics::AGENT_RUN_REJECTED, actor);
        if let Some(code) = reason_code {
            event = event.reason(code);
        }
        let row = self
            .move_run(
                run_id,
                vec![RunStatus::Proposed],
                RunStatus::Rejected,
                LeaseGuard::None,
                RunPatch {
                    status_reason: Some(reason_code),
                    ..Default::default()
                },
                event,
            )
            .await?;
        tracing::info!(target: "agent_runs", run_id, actor, "rejected");
        Ok(row)
    }

    /// Cancel from any non-terminal state, interrupting an in-flight adapter
    /// call when one is running in this process.
    pub async fn cancel_agent_run(&self, run_id: &str, actor: &str) -> EngineResult<AgentRunRow> {
        let row = self
            .move_run(
                run_id,
                RunStatus::sources_for(RunStatus::Cancelled),
                RunStatus::Cancelled,
                LeaseGuard::None,
                RunPatch {
                    status_reason: Some(Some(ReasonCode::Cancelled)),
                    release_lease: true,
                    ..Default::default()
                },
                NewAuditEvent::new(topics::AGENT_RUN_CANCELLED, actor).reason(ReasonCode::Cancelled),
            )
            .await?;
        let interrupted = self.interrupt(run_id);
        tracing::info!(target: "agent_runs", run_id, actor, interrupted, "cancelled");
        Ok(row)
    }

    /// Lease up to `limit` approved runs to `worker_id`. Racing workers never
    /// receive the same run.
    pub async fn claim_agent_runs(
        &self,
        worker_id: &str,
        limit: u32,
        lease_seconds: u64,
    ) -> EngineResult<Vec<AgentRunRow>> {
        self.check_lease(lease_seconds)?;
        let now = self.now();
        let cap = self.config().leases.max_running_per_adapter;
        let worker = worker_id.to_string();
        let claimed = self
            .store(worker_id, move |k| {
                k.claim_runs(&worker, limit, lease_seconds, now, cap)
            })
            .await?;
        self.inner.audit.publish(&claimed.events);
        if !claimed.value.is_empty() {
            tracing::debug!(target: "leases", worker_id, count = claimed.value.len(), "claimed runs");
        }
        Ok(claimed.value)
    }

    /// Run a leased, approved run through its adapter to a terminal or
    /// rescheduled state.
    pub async fn execute_agent_run(&self, run_id: &str, worker_id: &str) -> EngineResult<AgentRunRow> {
        let row = self.load_run(run_id, worker_id).await?;
        if row.status != RunStatus::Approved {
            let err = EngineError::InvalidTransition {
                entity: ENTITY,
                id: run_id.to_string(),
                from: row.status.as_str().into(),
                to: RunStatus::Running.as_str().into(),
            };
            return Err(self.refuse_run_attempt(&row, worker_id, "running", err).await);
        }
        if !row.is_held_by(worker_id, self.now()) {
            let err = EngineError::NotClaimed {
                entity: ENTITY,
                id: run_id.to_string(),
                worker_id: worker_id.to_string(),
            };
            return Err(self.refuse_run_attempt(&row, worker_id, "running", err).await);
        }

        // Registered before the start transition so a cancel that lands
        // after it always finds the handle.
        let inflight = self.track_inflight(run_id);
        let attempt = row.retry_count + 1;
        let run = self
            .move_run(
                run_id,
                vec![RunStatus::Approved],
                RunStatus::Running,
                self.run_lease(worker_id),
                RunPatch::default(),
                NewAuditEvent::new(topics::AGENT_RUN_STARTED, worker_id)
                    .with(json!({ "attempt": attempt })),
            )
            .await?;

        // Checked again at dispatch: ceilings may have tightened since
        // proposal and env must never carry credentials.
        let ceiling = self.config().budgets.as_budgets();
        if !run.budgets.within(&ceiling) {
            let msg = format!("budgets {:?} exceed ceilings {:?}", run.budgets, ceiling);
            return self
                .fail_run(&run, worker_id, ReasonCode::BudgetExceeded, msg, None, topics::AGENT_RUN_FAILED)
                .await;
        }
        let leaked = credential_keys(&run.env);
        if !leaked.is_empty() {
            let msg = format!("execution env carries credentials: {}", leaked.join(", "));
            return self
                .fail_run(&run, worker_id, ReasonCode::CredentialForbidden, msg, None, topics::AGENT_RUN_FAILED)
                .await;
        }
        let Some(adapter) = self.inner.adapters.get(&run.adapter_name) else {
            let msg = format!("adapter {:?} is not registered", run.adapter_name);
            return self
                .fail_run(&run, worker_id, ReasonCode::UnknownAdapter, msg, None, topics::AGENT_RUN_FAILED)
                .await;
        };

        let item = WorkItem::AgentRun(RunWork {
            run_id: run.run_id.clone(),
            idempotency_key: run.idempotency_key.clone(),
            goal: run.goal.clone(),
            model: run.model.clone(),
            repo: run.repo.clone(),
            budgets: run.budgets,
            tools_allowed: run.tools_allowed.clone(),
            env: run.env.clone(),
            attempt,
        });
        let limits = Limits {
            wall: Some(Duration::from_secs(run.budgets.max_wall_seconds)),
            budgets: Some(run.budgets),
            tools_allowed: Some(run.tools_allowed.clone()),
        };
        let lease = LeaseRef::Run {
            id: run.run_id.clone(),
            worker_id: worker_id.to_string(),
        };
        tracing::info!(target: "agent_runs", run_id, worker_id, attempt, adapter = adapter.name(), "running");
        let outcome = self
            .drive(adapter, item, limits, lease, inflight.notify())
            .await;
        drop(inflight);

        match outcome {
            Outcome::Succeeded {
                job_id,
                artifacts,
                usage,
                ..
            } => {
                let event = NewAuditEvent::new(topics::AGENT_RUN_COMPLETED, worker_id).with(json!({
                    "job_id": job_id,
                    "artifact_paths": artifacts,
                    "usage": usage,
                    "attempt": attempt,
                }));
                let done = self
                    .move_run(
                        run_id,
                        vec![RunStatus::Running],
                        RunStatus::Completed,
                        self.run_lease(worker_id),
                        RunPatch {
                            status_reason: Some(None),
                            job_id: Some(job_id),
                            artifact_paths: Some(artifacts),
                            release_lease: true,
                            ..Default::default()
                        },
                        event,
                    )
                    .await?;
                tracing::info!(target: "agent_runs", run_id, attempt, "completed");
                Ok(done)
            }
            Outcome::Failed {
                job_id,
                reason,
                message,
                retry_after,
            } => {
                let decision =
                    self.inner
                        .retry
                        .decide(reason, run.retry_count, run.max_retries, retry_after, self.now());
                match decision {
                    RetryDecision::Retry {
                        retry_count,
                        next_attempt_at,
                        delay,
                    } => {
                        tracing::warn!(
                            target: "retry",
                            run_id,
                            reason = reason.as_str(),
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "run failed; retry scheduled"
                        );
                        let event = NewAuditEvent::new(topics::AGENT_RUN_RETRY_SCHEDULED, worker_id)
                            .reason(reason)
                            .with(json!({
                                "attempt": attempt,
                                "retry_count": retry_count,
                                "next_attempt_at": next_attempt_at,
                                "delay_ms": delay.as_millis() as u64,
                                "error": message,
                            }));
                        self.move_run(
                            run_id,
                            vec![RunStatus::Running],
                            RunStatus::Approved,
                            self.run_lease(worker_id),
                            RunPatch {
                                status_reason: Some(Some(reason)),
                                last_error: Some(message),
                                retry_count: Some(retry_count),
                                next_attempt_at: Some(next_attempt_at),
                                job_id,
                                release_lease: true,
                                ..Default::default()
                            },
                            event,
                        )
                        .await
                    }
                    RetryDecision::Exhausted { .. } => {
                        self.fail_run(
                            &run,
                            worker_id,
                            ReasonCode::RetryBudgetExhausted,
                            format!("{} ({})", message, reason.as_str()),
                            job_id,
                            topics::RETRY_BUDGET_EXHAUSTED,
                        )
                        .await
                    }
                    RetryDecision::Terminal(code) => {
                        self.fail_run(&run, worker_id, code, message, job_id, topics::AGENT_RUN_FAILED)
                            .await
                    }
                }
            }
            Outcome::Exceeded {
                job_id,
                reason,
                message,
            } => {
                self.fail_run(&run, worker_id, reason, message, job_id, topics::AGENT_RUN_FAILED)
                    .await
            }
            Outcome::Cancelled => self.load_run(run_id, worker_id).await,
            Outcome::LeaseLost { job_id } => {
                let current = self.load_run(run_id, worker_id).await?;
                if current.status.is_terminal() || current.status == RunStatus::Failed {
                    return Ok(current);
                }
                let err = EngineError::NotClaimed {
                    entity: ENTITY,
                    id: run_id.to_string(),
                    worker_id: worker_id.to_string(),
                };
                Err(self
                    .refuse_run_attempt_on_job(&current, worker_id, "completed", err, Some(&job_id))
                    .await)
            }
        }
    }

    /// Return `running` runs whose holder stopped heartbeating to the queue,
    /// or fail them once their retry budget is spent.
    pub async fn reap_expired_leases(&self) -> EngineResult<Vec<AgentRunRow>> {
        let now = self.now();
        let expired = self
            .store("system", move |k| k.expired_running_runs(now))
            .await?;
        let mut reaped = Vec::new();
        for row in expired {
            let guard = match &row.claimed_by {
                Some(holder) => LeaseGuard::Expired {
                    worker_id: holder.clone(),
                    now,
                },
                None => LeaseGuard::None,
            };
            let holder = row.claimed_by.clone().unwrap_or_default();
            let moved = if row.retry_count < row.max_retries {
                self.move_run(
                    &row.run_id,
                    vec![RunStatus::Running],
                    RunStatus::Approved,
                    guard,
                    RunPatch {
                        status_reason: Some(Some(ReasonCode::LeaseExpired)),
                        last_error: Some(format!("lease held by {holder} expired")),
                        retry_count: Some(row.retry_count + 1),
                        release_lease: true,
                        ..Default::default()
                    },
                    NewAuditEvent::new(topics::AGENT_RUN_LEASE_EXPIRED, "system")
                        .reason(ReasonCode::LeaseExpired)
                        .with(json!({ "previous_holder": holder })),
                )
                .await
            } else {
                self.move_run(
                    &row.run_id,
                    vec![RunStatus::Running],
                    RunStatus::Failed,
                    guard,
                    RunPatch {
                        status_reason: Some(Some(ReasonCode::RetryBudgetExhausted)),
                        last_error: Some(format!("lease held by {holder} expired")),
                        release_lease: true,
                        ..Default::default()
                    },
                    NewAuditEvent::new(topics::RETRY_BUDGET_EXHAUSTED, "system")
                        .reason(ReasonCode::RetryBudgetExhausted)
                        .with(json!({ "previous_holder": holder, "last_reason": "lease_expired" })),
                )
                .await
            };
            match moved {
                Ok(run) => {
                    tracing::warn!(
                        target: "leases",
                        run_id = %run.run_id,
                        previous_holder = %holder,
                        status = run.status.as_str(),
                        "reaped expired lease"
                    );
                    reaped.push(run);
                }
                // Renewed or finished between the scan and the transition.
                Err(EngineError::InvalidTransition { .. } | EngineError::NotClaimed { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(reaped)
    }

    pub async fn get_agent_run(&self, run_id: &str) -> EngineResult<AgentRunRow> {
        let key = run_id.to_string();
        self.store("system", move |k| k.get_run(&key))
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: ENTITY,
                id: run_id.to_string(),
            })
    }

    pub async fn list_agent_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
        offset: u64,
    ) -> EngineResult<Page<AgentRunRow>> {
        let limit = limit.clamp(1, tollgate_kernel::MAX_AUDIT_PAGE);
        let items = self
            .store("system", move |k| k.list_runs(status, limit, offset))
            .await?;
        Ok(Page::from_items(items, offset, limit as u64))
    }

    fn validate_run(&self, spec: &ProposeAgentRun) -> EngineResult<()> {
        if spec.goal.trim().is_empty() {
            return Err(EngineError::validation(
                ReasonCode::ValidationFailed,
                "goal must not be empty",
            ));
        }
        if spec.model.trim().is_empty() {
            return Err(EngineError::validation(
                ReasonCode::ValidationFailed,
                "model must not be empty",
            ));
        }
        let leaked = credential_keys(&spec.env);
        if !leaked.is_empty() {
            return Err(EngineError::validation(
                ReasonCode::CredentialForbidden,
                format!("env must not carry write credentials: {}", leaked.join(", ")),
            ));
        }
        if !self.inner.adapters.contains(&spec.adapter_name) {
            return Err(EngineError::validation(
                ReasonCode::UnknownAdapter,
                format!("adapter {:?} is not registered", spec.adapter_name),
            ));
        }
        let ceiling = self.config().budgets.as_budgets();
        if !spec.budgets.within(&ceiling) {
            return Err(EngineError::validation(
                ReasonCode::BudgetExceeded,
                format!(
                    "budgets must be positive and within {} tokens, {} tool calls, {}s",
                    ceiling.max_total_tokens, ceiling.max_tool_calls, ceiling.max_wall_seconds
                ),
            ));
        }
        Ok(())
    }

    fn run_lease(&self, worker_id: &str) -> LeaseGuard {
        LeaseGuard::Live {
            worker_id: worker_id.to_string(),
            now: self.now(),
        }
    }

    async fn load_run(&self, run_id: &str, actor: &str) -> EngineResult<AgentRunRow> {
        let key = run_id.to_string();
        match self.store(actor, move |k| k.get_run(&key)).await? {
            Some(row) => Ok(row),
            None => {
                let ev = NewAuditEvent::new(topics::TRANSITION_REJECTED, actor)
                    .run(run_id)
                    .reason(ReasonCode::NotFound)
                    .with(json!({ "entity": ENTITY }));
                self.record(ev).await?;
                Err(EngineError::NotFound {
                    entity: ENTITY,
                    id: run_id.to_string(),
                })
            }
        }
    }

    /// Terminal failure from `running`; no further automatic retries.
    async fn fail_run(
        &self,
        run: &AgentRunRow,
        worker_id: &str,
        reason: ReasonCode,
        message: String,
        job_id: Option<String>,
        event_type: &'static str,
    ) -> EngineResult<AgentRunRow> {
        tracing::warn!(
            target: "agent_runs",
            run_id = %run.run_id,
            reason = reason.as_str(),
            error = %message,
            "run failed"
        );
        let event = NewAuditEvent::new(event_type, worker_id)
            .reason(reason)
            .with(json!({
                "attempt": run.retry_count + 1,
                "retry_count": run.retry_count,
                "error": message,
            }));
        self.move_run(
            &run.run_id,
            vec![RunStatus::Running],
            RunStatus::Failed,
            self.run_lease(worker_id),
            RunPatch {
                status_reason: Some(Some(reason)),
                last_error: Some(message),
                job_id,
                release_lease: true,
                ..Default::default()
            },
            event,
        )
        .await
    }

    async fn move_run(
        &self,
        run_id: &str,
        from: Vec<RunStatus>,
        to: RunStatus,
        guard: LeaseGuard,
        patch: RunPatch,
        event: NewAuditEvent,
    ) -> EngineResult<AgentRunRow> {
        let now = self.now();
        let actor = event.actor.clone();
        let worker = match &guard {
            LeaseGuard::Live { worker_id, .. } | LeaseGuard::Expired { worker_id, .. } => {
                Some(worker_id.clone())
            }
            LeaseGuard::None => None,
        };
        let key = run_id.to_string();
        let out = self
            .store(&actor, move |k| {
                k.transition_run(&key, &from, to, guard, patch, event, now)
            })
            .await?;
        match out {
            Transition::Done(rec) => {
                self.inner.audit.publish(&rec.events);
                Ok(rec.value)
            }
            Transition::NotFound => {
                let ev = NewAuditEvent::new(topics::TRANSITION_REJECTED, &actor)
                    .run(run_id)
                    .reason(ReasonCode::NotFound)
                    .with(json!({ "entity": ENTITY, "attempted": to.as_str() }));
                self.record(ev).await?;
                Err(EngineError::NotFound {
                    entity: ENTITY,
                    id: run_id.to_string(),
                })
            }
            Transition::WrongState(row) => {
                let err = EngineError::InvalidTransition {
                    entity: ENTITY,
                    id: run_id.to_string(),
                    from: row.status.as_str().into(),
                    to: to.as_str().into(),
                };
                Err(self.refuse_run_attempt(&row, &actor, to.as_str(), err).await)
            }
            Transition::NotHeld(row) => {
                let err = EngineError::NotClaimed {
                    entity: ENTITY,
                    id: run_id.to_string(),
                    worker_id: worker.unwrap_or(actor.clone()),
                };
                Err(self.refuse_run_attempt(&row, &actor, to.as_str(), err).await)
            }
        }
    }

    async fn refuse_run_attempt(
        &self,
        row: &AgentRunRow,
        actor: &str,
        attempted: &str,
        err: EngineError,
    ) -> EngineError {
        self.refuse_run_attempt_on_job(row, actor, attempted, err, None).await
    }

    /// As [`Self::refuse_run_attempt`], naming the adapter job that was abandoned.
    async fn refuse_run_attempt_on_job(
        &self,
        row: &AgentRunRow,
        actor: &str,
        attempted: &str,
        err: EngineError,
        job_id: Option<&str>,
    ) -> EngineError {
        tracing::warn!(
            target: "agent_runs",
            run_id = %row.run_id,
            status = row.status.as_str(),
            attempted,
            reason = err.reason_code().as_str(),
            "transition refused"
        );
        let mut detail = json!({
            "entity": ENTITY,
            "from": row.status.as_str(),
            "attempted": attempted,
            "message": err.to_string(),
        });
        if let Some(job_id) = job_id {
            detail["job_id"] = json!(job_id);
        }
        let ev = NewAuditEvent::new(topics::TRANSITION_REJECTED, actor)
            .run(row.run_id.clone())
            .repo(row.repo.clone())
            .reason(err.reason_code())
            .with(detail);
        match self.record(ev).await {
            Ok(_) => err,
            Err(fault) => fault,
        }
    }

    async fn refuse_run(&self, spec: &ProposeAgentRun, actor: &str, err: EngineError) -> EngineError {
        tracing::warn!(
            target: "agent_runs",
            adapter = %spec.adapter_name,
            actor,
            reason = err.reason_code().as_str(),
            "proposal denied"
        );
        // Env values stay out of the log; keys are enough to explain a denial.
        let ev = NewAuditEvent::new(topics::AGENT_RUN_DENIED, actor)
            .repo(spec.repo.clone())
            .reason(err.reason_code())
            .with(json!({
                "adapter": spec.adapter_name,
                "model": spec.model,
                "budgets": spec.budgets,
                "env_keys": spec.env.keys().collect::<Vec<_>>(),
                "message": err.to_string(),
            }));
        match self.record(ev).await {
            Ok(_) => err,
            Err(fault) => fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_keys_are_detected_case_insensitively() {
        let env: BTreeMap<String, String> = [
            ("github_token", "x"),
            ("GH_TOKEN", "x"),
            ("DEPLOY_WRITE_TOKEN", "x"),
            ("ci_pat", "x"),
            ("LOG_LEVEL", "debug"),
            ("PATH", "/usr/bin"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut found = credential_keys(&env);
        found.sort();
        assert_eq!(
            found,
            vec!["DEPLOY_WRITE_TOKEN", "GH_TOKEN", "ci_pat", "github_token"]
        );
    }
}
