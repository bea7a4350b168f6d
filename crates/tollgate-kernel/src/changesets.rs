use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use tollgate_protocol::{ChangesetStatus, ReasonCode};
use tollgate_topics as topics;

use crate::audit::insert_event;
use crate::idempotency::{self, Resolution, KIND_CHANGESET};
use crate::rows::{
    ChangesetPatch, ChangesetRow, LeaseGuard, NewAuditEvent, NewChangeset, ProposeResult,
    Recorded, Transition, CHANGESET_COLS,
};
use crate::{format_ts, lease_expiry, in_list, Assignments, Kernel};

fn load(conn: &Connection, id: &str) -> Result<Option<ChangesetRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {CHANGESET_COLS} FROM changesets WHERE id=?"),
            params![id],
            ChangesetRow::from_row,
        )
        .optional()?;
    Ok(row)
}

fn insert(conn: &Connection, new: &NewChangeset, now: DateTime<Utc>) -> Result<()> {
    let ts = format_ts(&now);
    conn.execute(
        "INSERT INTO changesets(id,bundle_id,idempotency_key,intent_fingerprint,operation,category,repo,binding,payload,status,requires_approval,created_by,retry_count,max_retries,created_at,updated_at)
         VALUES(?,?,?,?,?,?,?,?,?,?,?,?,0,?,?,?)",
        params![
            new.id,
            new.bundle_id,
            new.idempotency_key,
            new.intent_fingerprint,
            new.operation.as_str(),
            new.operation.category().rank() as i64,
            new.repo,
            new.binding,
            serde_json::to_string(&new.payload)?,
            ChangesetStatus::Proposed.as_str(),
            new.requires_approval as i64,
            new.created_by,
            new.max_retries,
            ts,
            ts,
        ],
    )?;
    Ok(())
}

/// Event for `row` moving `from -> to`, with entity ids filled in.
fn transition_event(
    ev: NewAuditEvent,
    row: &ChangesetRow,
    from: ChangesetStatus,
    to: ChangesetStatus,
) -> NewAuditEvent {
    ev.changeset(row.id.clone())
        .repo(Some(row.repo.clone()))
        .with(json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "operation": row.operation.as_str(),
            "bundle_id": row.bundle_id,
        }))
}

impl Kernel {
    pub fn get_changeset(&self, id: &str) -> Result<Option<ChangesetRow>> {
        let conn = self.conn()?;
        load(&conn, id)
    }

    pub fn list_changesets(
        &self,
        status: Option<ChangesetStatus>,
        bundle_id: Option<&str>,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<ChangesetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGESET_COLS} FROM changesets
             WHERE (?1 IS NULL OR status=?1) AND (?2 IS NULL OR bundle_id=?2)
             ORDER BY created_at ASC, id ASC LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                status.map(|s| s.as_str()),
                bundle_id,
                limit.max(1) as i64,
                offset as i64
            ],
            ChangesetRow::from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Every member of a bundle in apply order.
    pub fn bundle_changesets(&self, bundle_id: &str) -> Result<Vec<ChangesetRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGESET_COLS} FROM changesets WHERE bundle_id=?
             ORDER BY category ASC, created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![bundle_id], ChangesetRow::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Persist a new changeset, or resolve to the entity already registered
    /// under its idempotency key. Runs as one transaction so concurrent
    /// proposals of the same key converge on a single row.
    pub fn propose_changeset(
        &self,
        new: NewChangeset,
        now: DateTime<Utc>,
    ) -> Result<ProposeResult<ChangesetRow>> {
        self.write_tx(|tx| {
            let mut events = Vec::new();
            let existing = match idempotency::lookup(tx, KIND_CHANGESET, &new.idempotency_key)? {
                Some(id) => load(tx, &id)?,
                None => None,
            };
            let resolution = match &existing {
                Some(row) => idempotency::resolve(
                    &row.id,
                    row.status.is_terminal_failure(),
                    &row.intent_fingerprint,
                    &new.intent_fingerprint,
                ),
                None => Resolution::Create,
            };
            match (resolution.clone(), existing) {
                (Resolution::Reuse(_), Some(row)) => {
                    let ev = NewAuditEvent::new(topics::CHANGESET_DEDUPLICATED, &new.created_by)
                        .changeset(row.id.clone())
                        .repo(Some(row.repo.clone()))
                        .with(json!({
                            "idempotency_key": row.idempotency_key,
                            "status": row.status.as_str(),
                        }));
                    events.push(insert_event(tx, ev, now)?);
                    return Ok(ProposeResult {
                        recorded: Recorded { value: row, events },
                        resolution,
                    });
                }
                (Resolution::Supersede(_), Some(old)) => {
                    let mut set = Assignments::default();
                    set.set("status", ChangesetStatus::Superseded.as_str());
                    set.set("reason_code", ReasonCode::Superseded.as_str());
                    set.set("updated_at", format_ts(&now));
                    set.apply(tx, "changesets", "id", &old.id)?;
                    let ev = transition_event(
                        NewAuditEvent::new(topics::CHANGESET_SUPERSEDED, &new.created_by)
                            .reason(ReasonCode::Superseded),
                        &old,
                        old.status,
                        ChangesetStatus::Superseded,
                    )
                    .with(json!({ "superseded_by": new.id }));
                    events.push(insert_event(tx, ev, now)?);
                }
                _ => {}
            }
            insert(tx, &new, now)?;
            idempotency::point(tx, KIND_CHANGESET, &new.idempotency_key, &new.id, now)?;
            let ev = NewAuditEvent::new(topics::CHANGESET_PROPOSED, &new.created_by)
                .changeset(new.id.clone())
                .repo(Some(new.repo.clone()))
                .with(json!({
                    "to": ChangesetStatus::Proposed.as_str(),
                    "operation": new.operation.as_str(),
                    "idempotency_key": new.idempotency_key,
                    "bundle_id": new.bundle_id,
                    "payload": new.payload,
                }));
            events.push(insert_event(tx, ev, now)?);
            let row = load(tx, &new.id)?
                .ok_or_else(|| anyhow::anyhow!("changeset {} vanished after insert", new.id))?;
            Ok(ProposeResult {
                recorded: Recorded { value: row, events },
                resolution,
            })
        })
    }

    /// Move a changeset to `to` if its current status is one of `from` (and
    /// a legal source for `to`) and `guard` admits its lease. The status
    /// check, update and audit append commit together or not at all.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_changeset(
        &self,
        id: &str,
        from: &[ChangesetStatus],
        to: ChangesetStatus,
        guard: LeaseGuard,
        patch: ChangesetPatch,
        event: NewAuditEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition<ChangesetRow>> {
        self.write_tx(|tx| {
            let Some(row) = load(tx, id)? else {
                return Ok(Transition::NotFound);
            };
            if !from.contains(&row.status) || !row.status.can_transition_to(to) {
                return Ok(Transition::WrongState(row));
            }
            if !guard.admits(row.claimed_by.as_deref(), row.claim_expires_at) {
                return Ok(Transition::NotHeld(row));
            }
            let mut set = Assignments::default();
            set.set("status", to.as_str());
            set.set("updated_at", format_ts(&now));
            if let Some(who) = patch.approved_by {
                set.set("approved_by", who);
                set.set("approved_at", format_ts(&now));
            }
            match patch.reason_code {
                Some(Some(code)) => set.set("reason_code", code.as_str()),
                Some(None) => set.set_null("reason_code"),
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
            if let Some(binding) = patch.binding {
                set.set("binding", binding);
            }
            if patch.release_lease {
                set.set_null("claimed_by");
                set.set_null("claim_expires_at");
            }
            set.apply(tx, "changesets", "id", id)?;
            let ev = insert_event(tx, transition_event(event, &row, row.status, to), now)?;
            let updated = load(tx, id)?
                .ok_or_else(|| anyhow::anyhow!("changeset {id} vanished during transition"))?;
            Ok(Transition::Done(Recorded {
                value: updated,
                events: vec![ev],
            }))
        })
    }

    /// Atomically lease up to `limit` runnable changesets to `worker_id`,
    /// moving each to `applying`.
    ///
    /// Runnable means approved (and not backing off), retry-pending with a
    /// due `next_attempt_at`, or applying under a lapsed lease. Within a
    /// bundle, a member is held back while any lower-category member is
    /// still in flight, so creates land before the edges that reference them.
    pub fn claim_changesets(
        &self,
        worker_id: &str,
        limit: u32,
        lease_seconds: u64,
        now: DateTime<Utc>,
        max_per_repo: Option<u32>,
        bundle_id: Option<&str>,
    ) -> Result<Recorded<Vec<ChangesetRow>>> {
        if limit == 0 {
            return Ok(Recorded {
                value: Vec::new(),
                events: Vec::new(),
            });
        }
        let in_flight = in_list([
            ChangesetStatus::Approved.as_str(),
            ChangesetStatus::Applying.as_str(),
            ChangesetStatus::Failed.as_str(),
        ]);
        let expires = format_ts(&lease_expiry(now, lease_seconds)?);
        self.write_tx(|tx| {
            let ts = format_ts(&now);
            let candidates: Vec<ChangesetRow> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {CHANGESET_COLS} FROM changesets c
                     WHERE (
                       (c.status='approved' AND (c.next_attempt_at IS NULL OR c.next_attempt_at<=?1))
                       OR (c.status='failed' AND c.next_attempt_at IS NOT NULL AND c.next_attempt_at<=?1)
                       OR (c.status='applying' AND (c.claim_expires_at IS NULL OR c.claim_expires_at<=?1))
                     )
                     AND (?2 IS NULL OR c.bundle_id=?2)
                     AND NOT EXISTS (
                       SELECT 1 FROM changesets p
                       WHERE c.bundle_id IS NOT NULL AND p.bundle_id=c.bundle_id
                         AND p.category<c.category AND p.status IN ({in_flight})
                     )
                     ORDER BY COALESCE(c.bundle_id, c.id) ASC, c.category ASC, c.created_at ASC, c.id ASC
                     LIMIT ?3"
                ))?;
                let scan = (limit as i64).saturating_mul(8).max(64);
                let rows = stmt.query_map(params![ts, bundle_id, scan], ChangesetRow::from_row)?;
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
            if max_per_repo.is_some() {
                let mut stmt = tx.prepare(
                    "SELECT repo, COUNT(1) FROM changesets
                     WHERE status='applying' AND claim_expires_at>? GROUP BY repo",
                )?;
                let rows = stmt.query_map(params![ts], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
                })?;
                for r in rows {
                    let (repo, n) = r?;
                    active.insert(repo, n);
                }
            }

            let mut claimed = Vec::new();
            let mut events = Vec::new();
            for row in candidates {
                if claimed.len() as u32 >= limit {
                    break;
                }
                if let Some(cap) = max_per_repo {
                    let n = active.entry(row.repo.clone()).or_insert(0);
                    if *n >= cap {
                        tracing::debug!(target: "leases", repo = %row.repo, cap, "repo claim quota reached");
                        continue;
                    }
                    *n += 1;
                }
                let n = tx.execute(
                    "UPDATE changesets SET status='applying', claimed_by=?, claim_expires_at=?, updated_at=?
                     WHERE id=? AND status=?",
                    params![worker_id, expires, ts, row.id, row.status.as_str()],
                )?;
                if n == 0 {
                    continue;
                }
                let ev = transition_event(
                    NewAuditEvent::new(topics::CHANGESET_CLAIMED, worker_id),
                    &row,
                    row.status,
                    ChangesetStatus::Applying,
                )
                .with(json!({
                    "worker_id": worker_id,
                    "claim_expires_at": expires,
                    "attempt": row.retry_count + 1,
                }));
                events.push(insert_event(tx, ev, now)?);
                if let Some(updated) = load(tx, &row.id)? {
                    claimed.push(updated);
                }
            }
            Ok(Recorded {
                value: claimed,
                events,
            })
        })
    }

    /// Extend a live `applying` lease. Heartbeats are not audited.
    pub fn renew_changeset_lease(
        &self,
        id: &str,
        worker_id: &str,
        lease_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let expires = format_ts(&lease_expiry(now, lease_seconds)?);
        let n = conn.execute(
            "UPDATE changesets SET claim_expires_at=?, updated_at=?
             WHERE id=? AND status='applying' AND claimed_by=? AND claim_expires_at>?",
            params![expires, format_ts(&now), id, worker_id, format_ts(&now)],
        )?;
        Ok(n > 0)
    }
}
