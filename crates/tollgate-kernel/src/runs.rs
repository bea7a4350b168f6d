use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use tollgate_protocol::RunStatus;
use tollgate_topics as topics;

use crate::audit::insert_event;
use crate::idempotency::{self, Resolution, KIND_AGENT_RUN};
use crate::rows::{
    AgentRunRow, LeaseGuard, NewAgentRun, NewAuditEvent, ProposeResult, Recorded, RunPatch,
    Transition, RUN_COLS,
};
use crate::{format_ts, lease_expiry, Assignments, Kernel};

fn load(conn: &Connection, run_id: &str) -> Result<Option<AgentRunRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {RUN_COLS} FROM agent_runs WHERE run_id=?"),
            params![run_id],
            AgentRunRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Runs that no longer answer for their intent once the intent changes.
fn is_retired(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::Rejected | RunStatus::Cancelled | RunStatus::Failed
    )
}

fn run_event(
    ev: NewAuditEvent,
    row: &AgentRunRow,
    from: RunStatus,
    to: RunStatus,
) -> NewAuditEvent {
    ev.run(row.run_id.clone())
        .repo(row.repo.clone())
        .with(json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "adapter": row.adapter_name,
        }))
}

impl Kernel {
    pub fn get_run(&self, run_id: &str) -> Result<Option<AgentRunRow>> {
        let conn = self.conn()?;
        load(&conn, run_id)
    }

    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<AgentRunRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM agent_runs WHERE (?1 IS NULL OR status=?1)
             ORDER BY created_at ASC, run_id ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit.max(1) as i64, offset as i64],
            AgentRunRow::from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Persist a new run or resolve to the run already registered under its
    /// idempotency key. A retired run whose intent changed keeps its history;
    /// only the key moves to the new run.
    pub fn propose_run(
        &self,
        new: NewAgentRun,
        now: DateTime<Utc>,
    ) -> Result<ProposeResult<AgentRunRow>> {
        self.write_tx(|tx| {
            let existing = match idempotency::lookup(tx, KIND_AGENT_RUN, &new.idempotency_key)? {
                Some(id) => load(tx, &id)?,
                None => None,
            };
            let resolution = match &existing {
                Some(row) => idempotency::resolve(
                    &row.run_id,
                    is_retired(row.status),
                    &row.intent_fingerprint,
                    &new.intent_fingerprint,
                ),
                None => Resolution::Create,
            };
            if let (Resolution::Reuse(_), Some(row)) = (&resolution, &existing) {
                let ev = NewAuditEvent::new(topics::AGENT_RUN_DEDUPLICATED, &new.created_by)
                    .run(row.run_id.clone())
                    .repo(row.repo.clone())
                    .with(json!({
                        "idempotency_key": row.idempotency_key,
                        "status": row.status.as_str(),
                    }));
                let ev = insert_event(tx, ev, now)?;
                return Ok(ProposeResult {
                    recorded: Recorded {
                        value: row.clone(),
                        events: vec![ev],
                    },
                    resolution: resolution.clone(),
                });
            }

            let ts = format_ts(&now);
            tx.execute(
                "INSERT INTO agent_runs(run_id,idempotency_key,intent_fingerprint,goal,model,repo,budgets,tools_allowed,adapter_name,status,created_by,retry_count,max_retries,artifact_paths,env,created_at,updated_at)
                 VALUES(?,?,?,?,?,?,?,?,?,?,?,0,?,'[]',?,?,?)",
                params![
                    new.run_id,
                    new.idempotency_key,
                    new.intent_fingerprint,
                    new.goal,
                    new.model,
                    new.repo,
                    serde_json::to_string(&new.budgets)?,
                    serde_json::to_string(&new.tools_allowed)?,
                    new.adapter_name,
                    RunStatus::Proposed.as_str(),
                    new.created_by,
                    new.max_retries,
                    serde_json::to_string(&new.env)?,
                    ts,
                    ts,
                ],
            )?;
            idempotency::point(tx, KIND_AGENT_RUN, &new.idempotency_key, &new.run_id, now)?;
            let supersedes = match &resolution {
                Resolution::Supersede(old) => Some(old.clone()),
                _ => None,
            };
            let ev = NewAuditEvent::new(topics::AGENT_RUN_PROPOSED, &new.created_by)
                .run(new.run_id.clone())
                .repo(new.repo.clone())
                .with(json!({
                    "to": RunStatus::Proposed.as_str(),
                    "goal": new.goal,
                    "model": new.model,
                    "adapter": new.adapter_name,
                    "budgets": new.budgets,
                    "tools_allowed": new.tools_allowed,
                    "idempotency_key": new.idempotency_key,
                    "supersedes": supersedes,
                }));
            let ev = insert_event(tx, ev, now)?;
            let row = load(tx, &new.run_id)?
                .ok_or_else(|| anyhow::anyhow!("run {} vanished after insert", new.run_id))?;
            Ok(ProposeResult {
                recorded: Recorded {
                    value: row,
                    events: vec![ev],
                },
                resolution,
            })
        })
    }

    /// Move a run from one of `from` to `to` if the lifecycle allows it and
    /// `guard` admits its lease. Entering `running` additionally requires a
    /// live lease.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_run(
        &self,
        run_id: &str,
        from: &[RunStatus],
        to: RunStatus,
        guard: LeaseGuard,
        patch: RunPatch,
        event: NewAuditEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition<AgentRunRow>> {
        self.write_tx(|tx| {
            let Some(row) = load(tx, run_id)? else {
                return Ok(Transition::NotFound);
            };
            if !from.contains(&row.status) || !row.status.can_transition_to(to) {
                return Ok(Transition::WrongState(row));
            }
            if !guard.admits(row.claimed_by.as_deref(), row.claim_expires_at) {
                return Ok(Transition::NotHeld(row));
            }
            let live = row.claimed_by.is_some()
                && row.claim_expires_at.map(|t| t > now).unwrap_or(false);
            if to == RunStatus::Running && !live {
                return Ok(Transition::NotHeld(row));
            }
            let mut set = Assignments::default();
            set.set("status", to.as_str());
            set.set("updated_at", format_ts(&now));
            if let Some(who) = patch.approved_by {
                set.set("approved_by", who);
            }
            match patch.status_reason {
                Some(Some(code)) => set.set("status_reason", code.as_str()),
                Some(None) => set.set_null("status_reason"),
                None => {}
            }
            if let Some(err) = patch.last_error {
                set.set("last_error", err);
            }
            if let Some(n) = patch.retry_count {
                set.set("retry_count", n);
            }
            if let Some(at) = patch.next_attempt_at {
                set.set("next_attempt_at", format_ts(&at));
            }
            if let Some(job) = patch.job_id {
                set.set("job_id", job);
            }
            if let Some(paths) = patch.artifact_paths {
                set.set("artifact_paths", serde_json::to_string(&paths)?);
            }
            if patch.release_lease {
                set.set_null("claimed_by");
                set.set_null("claim_expires_at");
            }
            set.apply(tx, "agent_runs", "run_id", run_id)?;
            let ev = insert_event(tx, run_event(event, &row, row.status, to), now)?;
            let updated = load(tx, run_id)?
                .ok_or_else(|| anyhow::anyhow!("run {run_id} vanished during transition"))?;
            Ok(Transition::Done(Recorded {
                value: updated,
                events: vec![ev],
            }))
        })
    }

    /// Atomically lease up to `limit` approved runs to `worker_id`.
    ///
    /// A run is claimable when nobody holds a live lease on it and its retry
    /// backoff (if any) has elapsed. Claiming does not change status.
    pub fn claim_runs(
        &self,
        worker_id: &str,
        limit: u32,
        lease_seconds: u64,
        now: DateTime<Utc>,
        max_per_adapter: Option<u32>,
    ) -> Result<Recorded<Vec<AgentRunRow>>> {
        if limit == 0 {
            return Ok(Recorded {
                value: Vec::new(),
                events: Vec::new(),
            });
        }
        let expires = format_ts(&lease_expiry(now, lease_seconds)?);
        self.write_tx(|tx| {
            let ts = format_ts(&now);
            let candidates: Vec<AgentRunRow> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {RUN_COLS} FROM agent_runs
                     WHERE status='approved'
                       AND (claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at<=?1)
                       AND (next_attempt_at IS NULL OR next_attempt_at<=?1)
                     ORDER BY created_at ASC, run_id ASC LIMIT ?2"
                ))?;
                let scan = (limit as i64).saturating_mul(8).max(64);
                let rows = stmt.query_map(params![ts, scan], AgentRunRow::from_row)?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                out
            };
            if candidates.is_empty() {
                return Ok(Recorded {
                    value: Vec::new(),
                    events: Vec::new(),
                });
            }

            let mut active: HashMap<String, u32> = HashMap::new();
            if max_per_adapter.is_some() {
                let mut stmt = tx.prepare(
                    "SELECT adapter_name, COUNT(1) FROM agent_runs
                     WHERE status IN ('approved','running') AND claimed_by IS NOT NULL
                       AND claim_expires_at>? GROUP BY adapter_name",
                )?;
                let rows = stmt.query_map(params![ts], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
                })?;
                for r in rows {
                    let (adapter, n) = r?;
                    active.insert(adapter, n);
                }
            }

            let mut claimed = Vec::new();
            let mut events = Vec::new();
            for row in candidates {
                if claimed.len() as u32 >= limit {
                    break;
                }
                if let Some(cap) = max_per_adapter {
                    let n = active.entry(row.adapter_name.clone()).or_insert(0);
                    if *n >= cap {
                        tracing::debug!(target: "leases", adapter = %row.adapter_name, cap, "adapter claim quota reached");
                        continue;
                    }
                    *n += 1;
                }
                // Compare-and-swap on the lease columns.
                let n = tx.execute(
                    "UPDATE agent_runs SET claimed_by=?1, claim_expires_at=?2, updated_at=?3
                     WHERE run_id=?4 AND status='approved'
                       AND (claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at<=?3)",
                    params![worker_id, expires, ts, row.run_id],
                )?;
                if n == 0 {
                    continue;
                }
                let ev = NewAuditEvent::new(topics::AGENT_RUN_CLAIMED, worker_id)
                    .run(row.run_id.clone())
                    .repo(row.repo.clone())
                    .with(json!({
                        "status": row.status.as_str(),
                        "worker_id": worker_id,
                        "claim_expires_at": expires,
                        "previous_holder": row.claimed_by,
                        "adapter": row.adapter_name,
                    }));
                events.push(insert_event(tx, ev, now)?);
                if let Some(updated) = load(tx, &row.run_id)? {
                    claimed.push(updated);
                }
            }
            Ok(Recorded {
                value: claimed,
                events,
            })
        })
    }

    /// Extend a live lease held by `worker_id`. Heartbeats are not audited.
    pub fn renew_run_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let expires = format_ts(&lease_expiry(now, lease_seconds)?);
        let n = conn.execute(
            "UPDATE agent_runs SET claim_expires_at=?1, updated_at=?2
             WHERE run_id=?3 AND claimed_by=?4 AND claim_expires_at>?2
               AND status IN ('approved','running')",
            params![expires, format_ts(&now), run_id, worker_id],
        )?;
        Ok(n > 0)
    }

    /// `running` runs whose lease lapsed by `now` (the holder stopped
    /// heartbeating).
    pub fn expired_running_runs(&self, now: DateTime<Utc>) -> Result<Vec<AgentRunRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM agent_runs
             WHERE status='running' AND (claim_expires_at IS NULL OR claim_expires_at<=?)
             ORDER BY claim_expires_at ASC, run_id ASC"
        ))?;
        let rows = stmt.query_map(params![format_ts(&now)], AgentRunRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}
