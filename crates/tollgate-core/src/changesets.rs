use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tollgate_kernel::{
    fingerprint, ChangesetPatch, ChangesetRow, IdempotencyKey, LeaseGuard, NewAuditEvent,
    NewChangeset, Resolution, Transition,
};
use tollgate_policy::{ActorContext, ActorKind, Decision};
use tollgate_protocol::{ChangesetStatus, Operation, Page, ReasonCode};
use tollgate_runtime::{ChangesetWork, WorkItem};
use tollgate_topics as topics;
use uuid::Uuid;

use crate::execute::{LeaseRef, Limits, Outcome};
use crate::retry::RetryDecision;
use crate::{EngineError, EngineResult, Orchestrator, Proposal};

const ENTITY: &str = "changeset";

/// A proposed external mutation as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeChangeset {
    pub operation: String,
    /// `owner/name`.
    pub repo: String,
    /// Existing object the operation targets, e.g. an issue number.
    #[serde(default)]
    pub binding: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Derived from operation, repo and payload when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// What one pass of [`Orchestrator::apply_bundle`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleReport {
    pub bundle_id: String,
    pub applied: Vec<String>,
    /// Members already applied before this pass.
    pub skipped: Vec<String>,
    /// Member whose attempt stopped the pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<ChangesetRow>,
    /// Members still short of a terminal status.
    pub pending: Vec<String>,
}

impl Orchestrator {
    pub async fn propose_changeset(
        &self,
        req: ProposeChangeset,
        actor: &ActorContext,
    ) -> EngineResult<Proposal<ChangesetRow>> {
        let decision = self
            .policy()
            .evaluate(&req.operation, Some(&req.repo), actor);
        let operation = match (decision, Operation::from_slug(&req.operation)) {
            (Decision::Deny(d), _) => {
                let err = EngineError::Denied {
                    reason_code: d.reason_code,
                    message: d.message,
                };
                return Err(self.refuse_changeset(&req, &actor.actor, err).await);
            }
            (Decision::Allow, None) => {
                let err = EngineError::Denied {
                    reason_code: ReasonCode::UnknownOperation,
                    message: format!("operation {:?} is not recognised", req.operation),
                };
                return Err(self.refuse_changeset(&req, &actor.actor, err).await);
            }
            (Decision::Allow, Some(op)) => op,
        };
        if let Err(err) = validate(&req, operation) {
            return Err(self.refuse_changeset(&req, &actor.actor, err).await);
        }

        let key = match req.idempotency_key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => IdempotencyKey::explicit(k),
            _ => IdempotencyKey::derive(operation.as_str(), &req.repo, &req.payload),
        };
        let new = NewChangeset {
            id: Uuid::new_v4().to_string(),
            bundle_id: req.bundle_id,
            idempotency_key: key.into_string(),
            intent_fingerprint: fingerprint(&req.payload),
            operation,
            repo: req.repo,
            binding: req.binding,
            payload: req.payload,
            requires_approval: true,
            created_by: actor.actor.clone(),
            max_retries: req.max_retries.unwrap_or(self.config().retry.max_retries),
        };
        let now = self.now();
        let result = self
            .store(&actor.actor, move |k| k.propose_changeset(new, now))
            .await?;
        self.inner.audit.publish(&result.recorded.events);
        let row = result.recorded.value;
        let (deduplicated, superseded) = match result.resolution {
            Resolution::Create => (false, None),
            Resolution::Reuse(_) => (true, None),
            Resolution::Supersede(old) => (false, Some(old)),
        };
        tracing::info!(
            target: "changesets",
            id = %row.id,
            operation = row.operation.as_str(),
            repo = %row.repo,
            deduplicated,
            superseded = superseded.as_deref().unwrap_or(""),
            "proposed"
        );
        Ok(Proposal {
            entity: row,
            deduplicated,
            superseded,
        })
    }

    /// Record a human approval. Only `proposed` changesets can be approved.
    pub async fn approve_changeset(
        &self,
        id: &str,
        approver: &ActorContext,
    ) -> EngineResult<ChangesetRow> {
        if approver.kind != ActorKind::Human || approver.actor.trim().is_empty() {
            let ev = NewAuditEvent::new(topics::CHANGESET_DENIED, &approver.actor)
                .changeset(id)
                .reason(ReasonCode::AuthContextDenied)
                .with(json!({ "action": "approve", "actor_kind": approver.kind }));
            self.record(ev).await?;
            return Err(EngineError::Denied {
                reason_code: ReasonCode::AuthContextDenied,
                message: "changesets can only be approved by a human".into(),
            });
        }
        let row = self
            .move_changeset(
                id,
                vec![ChangesetStatus::Proposed],
                ChangesetStatus::Approved,
                LeaseGuard::None,
                ChangesetPatch {
                    approved_by: Some(approver.actor.clone()),
                    ..Default::default()
                },
                NewAuditEvent::new(topics::CHANGESET_APPROVED, &approver.actor),
            )
            .await?;
        tracing::info!(target: "changesets", id, approver = %approver.actor, "approved");
        Ok(row)
    }

    /// Approve every `proposed` member of a bundle, one audited approval
    /// each. Members in other states are left alone.
    pub async fn approve_bundle(
        &self,
        bundle_id: &str,
        approver: &ActorContext,
    ) -> EngineResult<Vec<ChangesetRow>> {
        let members = self.bundle_members(bundle_id, &approver.actor).await?;
        let mut approved = Vec::new();
        for cs in members {
            if cs.status == ChangesetStatus::Proposed {
                approved.push(self.approve_changeset(&cs.id, approver).await?);
            }
        }
        Ok(approved)
    }

    pub async fn reject_changeset(
        &self,
        id: &str,
        actor: &str,
        note: Option<String>,
    ) -> EngineResult<ChangesetRow> {
        let row = self
            .move_changeset(
                id,
                vec![ChangesetStatus::Proposed, ChangesetStatus::Approved],
                ChangesetStatus::Rejected,
                LeaseGuard::None,
                ChangesetPatch {
                    last_error: note.clone(),
                    release_lease: true,
                    ..Default::default()
                },
                NewAuditEvent::new(topics::CHANGESET_REJECTED, actor).with(json!({ "note": note })),
            )
            .await?;
        tracing::info!(target: "changesets", id, actor, "rejected");
        Ok(row)
    }

    /// Stop a changeset from any non-terminal state. An apply in flight is
    /// interrupted and its job cancelled.
    pub async fn cancel_changeset(&self, id: &str, actor: &str) -> EngineResult<ChangesetRow> {
        let row = self
            .move_changeset(
                id,
                ChangesetStatus::sources_for(ChangesetStatus::Rejected),
                ChangesetStatus::Rejected,
                LeaseGuard::None,
                ChangesetPatch {
                    reason_code: Some(Some(ReasonCode::Cancelled)),
                    release_lease: true,
                    ..Default::default()
                },
                NewAuditEvent::new(topics::CHANGESET_REJECTED, actor).reason(ReasonCode::Cancelled),
            )
            .await?;
        let interrupted = self.interrupt(id);
        tracing::info!(target: "changesets", id, actor, interrupted, "cancelled");
        Ok(row)
    }

    /// Lease runnable changesets to `worker_id`, moving them to `applying`.
    pub async fn claim_changesets(
        &self,
        worker_id: &str,
        limit: u32,
        lease_seconds: u64,
    ) -> EngineResult<Vec<ChangesetRow>> {
        self.claim_changesets_in(worker_id, limit, lease_seconds, None)
            .await
    }

    async fn claim_changesets_in(
        &self,
        worker_id: &str,
        limit: u32,
        lease_seconds: u64,
        bundle_id: Option<&str>,
    ) -> EngineResult<Vec<ChangesetRow>> {
        self.check_lease(lease_seconds)?;
        let now = self.now();
        let cap = self.config().leases.max_claims_per_repo;
        let worker = worker_id.to_string();
        let bundle = bundle_id.map(str::to_string);
        let claimed = self
            .store(worker_id, move |k| {
                k.claim_changesets(&worker, limit, lease_seconds, now, cap, bundle.as_deref())
            })
            .await?;
        self.inner.audit.publish(&claimed.events);
        if !claimed.value.is_empty() {
            tracing::debug!(target: "leases", worker_id, count = claimed.value.len(), "claimed changesets");
        }
        Ok(claimed.value)
    }

    /// Execute a leased changeset through the configured changeset adapter.
    ///
    /// Success ends in `applied`. Transient failures park the changeset in
    /// `failed` until its backoff elapses, or dead-letter it once retries
    /// run out; anything else dead-letters it immediately.
    pub async fn apply_changeset(&self, id: &str, worker_id: &str) -> EngineResult<ChangesetRow> {
        let now = self.now();
        let row = self.load_changeset(id, worker_id).await?;
        if row.status != ChangesetStatus::Applying || !row.is_held_by(worker_id, now) {
            let err = match row.status {
                ChangesetStatus::Approved
                | ChangesetStatus::Applying
                | ChangesetStatus::Failed => EngineError::NotClaimed {
                    entity: ENTITY,
                    id: id.to_string(),
                    worker_id: worker_id.to_string(),
                },
                other => EngineError::InvalidTransition {
                    entity: ENTITY,
                    id: id.to_string(),
                    from: other.as_str().into(),
                    to: ChangesetStatus::Applied.as_str().into(),
                },
            };
            return Err(self.refuse_attempt(&row, worker_id, "applied", err).await);
        }
        let inflight = self.track_inflight(id);

        // Policy can change between approval and apply.
        let executor = ActorContext {
            actor: worker_id.to_string(),
            kind: ActorKind::Service,
            has_write_token: self.has_write_token(),
            roles: Vec::new(),
        };
        if let Decision::Deny(d) =
            self.policy()
                .evaluate(row.operation.as_str(), Some(&row.repo), &executor)
        {
            return self
                .dead_letter(&row, worker_id, d.reason_code, d.message, None, topics::CHANGESET_DEAD_LETTERED)
                .await;
        }
        let adapter_name = &self.config().adapters.changeset_adapter;
        let Some(adapter) = self.inner.adapters.get(adapter_name) else {
            let msg = format!("changeset adapter {adapter_name:?} is not registered");
            return self
                .dead_letter(&row, worker_id, ReasonCode::UnknownAdapter, msg, None, topics::CHANGESET_DEAD_LETTERED)
                .await;
        };

        let attempt = row.retry_count + 1;
        let item = WorkItem::Changeset(ChangesetWork {
            changeset_id: row.id.clone(),
            idempotency_key: row.idempotency_key.clone(),
            operation: row.operation,
            repo: row.repo.clone(),
            binding: row.binding.clone(),
            payload: row.payload.clone(),
            attempt,
        });
        let lease = LeaseRef::Changeset {
            id: row.id.clone(),
            worker_id: worker_id.to_string(),
        };
        tracing::info!(target: "changesets", id, worker_id, attempt, adapter = adapter.name(), "applying");
        let outcome = self
            .drive(adapter, item, Limits::default(), lease, inflight.notify())
            .await;
        drop(inflight);

        match outcome {
            Outcome::Succeeded {
                job_id, binding, ..
            } => {
                let event = NewAuditEvent::new(topics::CHANGESET_APPLIED, worker_id).with(json!({
                    "job_id": job_id,
                    "binding": binding,
                    "attempt": attempt,
                }));
                let applied = self
                    .move_changeset(
                        id,
                        vec![ChangesetStatus::Applying],
                        ChangesetStatus::Applied,
                        self.live(worker_id),
                        ChangesetPatch {
                            reason_code: Some(None),
                            job_id: Some(job_id),
                            binding,
                            release_lease: true,
                            ..Default::default()
                        },
                        event,
                    )
                    .await?;
                tracing::info!(target: "changesets", id, attempt, "applied");
                Ok(applied)
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
                        .decide(reason, row.retry_count, row.max_retries, retry_after, self.now());
                match decision {
                    RetryDecision::Retry {
                        retry_count,
                        next_attempt_at,
                        delay,
                    } => {
                        tracing::warn!(
                            target: "retry",
                            id,
                            reason = reason.as_str(),
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "apply failed; retry scheduled"
                        );
                        let event = NewAuditEvent::new(topics::CHANGESET_RETRY_SCHEDULED, worker_id)
                            .reason(reason)
                            .with(json!({
                                "attempt": attempt,
                                "retry_count": retry_count,
                                "next_attempt_at": next_attempt_at,
                                "delay_ms": delay.as_millis() as u64,
                                "error": message,
                            }));
                        self.move_changeset(
                            id,
                            vec![ChangesetStatus::Applying],
                            ChangesetStatus::Failed,
                            self.live(worker_id),
                            ChangesetPatch {
                                reason_code: Some(Some(reason)),
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
                        self.dead_letter(
                            &row,
                            worker_id,
                            ReasonCode::RetryBudgetExhausted,
                            format!("{} ({})", message, reason.as_str()),
                            job_id,
                            topics::RETRY_BUDGET_EXHAUSTED,
                        )
                        .await
                    }
                    RetryDecision::Terminal(code) => {
                        self.dead_letter(&row, worker_id, code, message, job_id, topics::CHANGESET_DEAD_LETTERED)
                            .await
                    }
                }
            }
            Outcome::Exceeded {
                job_id,
                reason,
                message,
            } => {
                self.dead_letter(&row, worker_id, reason, message, job_id, topics::CHANGESET_DEAD_LETTERED)
                    .await
            }
            Outcome::Cancelled => self.load_changeset(id, worker_id).await,
            Outcome::LeaseLost { job_id } => {
                let current = self.load_changeset(id, worker_id).await?;
                if current.status.is_terminal() {
                    return Ok(current);
                }
                let err = EngineError::NotClaimed {
                    entity: ENTITY,
                    id: id.to_string(),
                    worker_id: worker_id.to_string(),
                };
                Err(self
                    .refuse_attempt_on_job(&current, worker_id, "applied", err, Some(&job_id))
                    .await)
            }
        }
    }

    /// Apply a bundle's runnable members one at a time in category order.
    ///
    /// Earlier members are never rolled back. The pass stops at the first
    /// member that does not end `applied`; a later pass picks up from there
    /// once that member is runnable again.
    pub async fn apply_bundle(
        &self,
        bundle_id: &str,
        worker_id: &str,
        lease_seconds: u64,
    ) -> EngineResult<BundleReport> {
        self.check_lease(lease_seconds)?;
        let members = self.bundle_members(bundle_id, worker_id).await?;
        let mut report = BundleReport {
            bundle_id: bundle_id.to_string(),
            skipped: members
                .iter()
                .filter(|cs| cs.status == ChangesetStatus::Applied)
                .map(|cs| cs.id.clone())
                .collect(),
            ..Default::default()
        };
        loop {
            let claimed = self
                .claim_changesets_in(worker_id, 1, lease_seconds, Some(bundle_id))
                .await?;
            let Some(next) = claimed.into_iter().next() else {
                break;
            };
            let done = self.apply_changeset(&next.id, worker_id).await?;
            if done.status == ChangesetStatus::Applied {
                report.applied.push(done.id);
            } else {
                report.stopped_at = Some(done);
                break;
            }
        }
        report.pending = self
            .bundle_members(bundle_id, worker_id)
            .await?
            .into_iter()
            .filter(|cs| !cs.status.is_terminal())
            .map(|cs| cs.id)
            .collect();
        tracing::info!(
            target: "changesets",
            bundle_id,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            pending = report.pending.len(),
            "bundle pass finished"
        );
        Ok(report)
    }

    pub async fn get_changeset(&self, id: &str) -> EngineResult<ChangesetRow> {
        let key = id.to_string();
        self.store("system", move |k| k.get_changeset(&key))
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: ENTITY,
                id: id.to_string(),
            })
    }

    pub async fn list_changesets(
        &self,
        status: Option<ChangesetStatus>,
        bundle_id: Option<String>,
        limit: u32,
        offset: u64,
    ) -> EngineResult<Page<ChangesetRow>> {
        let limit = limit.clamp(1, tollgate_kernel::MAX_AUDIT_PAGE);
        let items = self
            .store("system", move |k| {
                k.list_changesets(status, bundle_id.as_deref(), limit, offset)
            })
            .await?;
        Ok(Page::from_items(items, offset, limit as u64))
    }

    async fn bundle_members(&self, bundle_id: &str, actor: &str) -> EngineResult<Vec<ChangesetRow>> {
        let key = bundle_id.to_string();
        let members = self
            .store(actor, move |k| k.bundle_changesets(&key))
            .await?;
        if members.is_empty() {
            return Err(EngineError::NotFound {
                entity: "bundle",
                id: bundle_id.to_string(),
            });
        }
        Ok(members)
    }

    async fn load_changeset(&self, id: &str, actor: &str) -> EngineResult<ChangesetRow> {
        let key = id.to_string();
        match self.store(actor, move |k| k.get_changeset(&key)).await? {
            Some(row) => Ok(row),
            None => {
                let ev = NewAuditEvent::new(topics::TRANSITION_REJECTED, actor)
                    .changeset(id)
                    .reason(ReasonCode::NotFound)
                    .with(json!({ "entity": ENTITY }));
                self.record(ev).await?;
                Err(EngineError::NotFound {
                    entity: ENTITY,
                    id: id.to_string(),
                })
            }
        }
    }

    fn live(&self, worker_id: &str) -> LeaseGuard {
        LeaseGuard::Live {
            worker_id: worker_id.to_string(),
            now: self.now(),
        }
    }

    /// Terminal failure from `applying`.
    async fn dead_letter(
        &self,
        row: &ChangesetRow,
        worker_id: &str,
        reason: ReasonCode,
        message: String,
        job_id: Option<String>,
        event_type: &'static str,
    ) -> EngineResult<ChangesetRow> {
        tracing::warn!(
            target: "retry",
            id = %row.id,
            reason = reason.as_str(),
            error = %message,
            "changeset dead-lettered"
        );
        let event = NewAuditEvent::new(event_type, worker_id)
            .reason(reason)
            .with(json!({
                "attempt": row.retry_count + 1,
                "retry_count": row.retry_count,
                "error": message,
            }));
        self.move_changeset(
            &row.id,
            vec![ChangesetStatus::Applying],
            ChangesetStatus::DeadLettered,
            self.live(worker_id),
            ChangesetPatch {
                reason_code: Some(Some(reason)),
                last_error: Some(message),
                job_id,
                release_lease: true,
                ..Default::default()
            },
            event,
        )
        .await
    }

    async fn move_changeset(
        &self,
        id: &str,
        from: Vec<ChangesetStatus>,
        to: ChangesetStatus,
        guard: LeaseGuard,
        patch: ChangesetPatch,
        event: NewAuditEvent,
    ) -> EngineResult<ChangesetRow> {
        let now = self.now();
        let actor = event.actor.clone();
        let worker = match &guard {
            LeaseGuard::Live { worker_id, .. } | LeaseGuard::Expired { worker_id, .. } => {
                Some(worker_id.clone())
            }
            LeaseGuard::None => None,
        };
        let key = id.to_string();
        let out = self
            .store(&actor, move |k| {
                k.transition_changeset(&key, &from, to, guard, patch, event, now)
            })
            .await?;
        match out {
            Transition::Done(rec) => {
                self.inner.audit.publish(&rec.events);
                Ok(rec.value)
            }
            Transition::NotFound => {
                let ev = NewAuditEvent::new(topics::TRANSITION_REJECTED, &actor)
                    .changeset(id)
                    .reason(ReasonCode::NotFound)
                    .with(json!({ "entity": ENTITY, "attempted": to.as_str() }));
                self.record(ev).await?;
                Err(EngineError::NotFound {
                    entity: ENTITY,
                    id: id.to_string(),
                })
            }
            Transition::WrongState(row) => {
                let err = EngineError::InvalidTransition {
                    entity: ENTITY,
                    id: id.to_string(),
                    from: row.status.as_str().into(),
                    to: to.as_str().into(),
                };
                Err(self.refuse_attempt(&row, &actor, to.as_str(), err).await)
            }
            Transition::NotHeld(row) => {
                let err = EngineError::NotClaimed {
                    entity: ENTITY,
                    id: id.to_string(),
                    worker_id: worker.unwrap_or(actor.clone()),
                };
                Err(self.refuse_attempt(&row, &actor, to.as_str(), err).await)
            }
        }
    }

    /// Audit a refused state change. The entity is untouched.
    async fn refuse_attempt(
        &self,
        row: &ChangesetRow,
        actor: &str,
        attempted: &str,
        err: EngineError,
    ) -> EngineError {
        self.refuse_attempt_on_job(row, actor, attempted, err, None).await
    }

    /// As [`Self::refuse_attempt`], naming the adapter job that was abandoned.
    async fn refuse_attempt_on_job(
        &self,
        row: &ChangesetRow,
        actor: &str,
        attempted: &str,
        err: EngineError,
        job_id: Option<&str>,
    ) -> EngineError {
        tracing::warn!(
            target: "changesets",
            id = %row.id,
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
            .changeset(row.id.clone())
            .repo(Some(row.repo.clone()))
            .reason(err.reason_code())
            .with(detail);
        match self.record(ev).await {
            Ok(_) => err,
            Err(fault) => fault,
        }
    }

    /// Audit a proposal that was turned away before anything was stored.
    async fn refuse_changeset(
        &self,
        req: &ProposeChangeset,
        actor: &str,
        err: EngineError,
    ) -> EngineError {
        tracing::warn!(
            target: "changesets",
            operation = %req.operation,
            repo = %req.repo,
            actor,
            reason = err.reason_code().as_str(),
            "proposal denied"
        );
        let ev = NewAuditEvent::new(topics::CHANGESET_DENIED, actor)
            .repo(Some(req.repo.clone()))
            .reason(err.reason_code())
            .with(json!({
                "operation": req.operation,
                "idempotency_key": req.idempotency_key,
                "bundle_id": req.bundle_id,
                "message": err.to_string(),
            }));
        match self.record(ev).await {
            Ok(_) => err,
            Err(fault) => fault,
        }
    }
}

fn validate(req: &ProposeChangeset, operation: Operation) -> EngineResult<()> {
    if operation == Operation::ProposeAgentRun {
        return Err(EngineError::validation(
            ReasonCode::ValidationFailed,
            "agent runs are proposed with propose_agent_run, not as changesets",
        ));
    }
    match req.repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {}
        _ => {
            return Err(EngineError::validation(
                ReasonCode::ValidationFailed,
                format!("repo {:?} is not of the form owner/name", req.repo),
            ))
        }
    }
    if !req.payload.is_object() {
        return Err(EngineError::validation(
            ReasonCode::ValidationFailed,
            "payload must be a JSON object",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(op: &str, repo: &str, payload: Value) -> ProposeChangeset {
        ProposeChangeset {
            operation: op.into(),
            repo: repo.into(),
            binding: None,
            payload,
            idempotency_key: None,
            bundle_id: None,
            max_retries: None,
        }
    }

    #[test]
    fn validation_rejects_malformed_requests() {
        let op = Operation::CreateIssue;
        assert!(validate(&req("create_issue", "org/repo", json!({"title": "x"})), op).is_ok());
        for bad in ["org", "/repo", "org/", "a/b/c"] {
            let err = validate(&req("create_issue", bad, json!({})), op).expect_err(bad);
            assert_eq!(err.reason_code(), ReasonCode::ValidationFailed);
        }
        assert!(validate(&req("create_issue", "org/repo", json!(["x"])), op).is_err());
        assert!(validate(
            &req("propose_agent_run", "org/repo", json!({})),
            Operation::ProposeAgentRun
        )
        .is_err());
    }
}
