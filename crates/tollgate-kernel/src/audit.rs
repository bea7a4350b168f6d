use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::rows::{AuditEvent, NewAuditEvent, AUDIT_COLS};
use crate::{format_ts, Kernel};

pub const MAX_AUDIT_PAGE: u32 = 500;
const DEFAULT_AUDIT_PAGE: u32 = 100;

/// Filters for [`Kernel::query_audit`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub run_id: Option<String>,
    pub changeset_id: Option<String>,
    pub event_type: Option<String>,
    pub repo: Option<String>,
    pub actor: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u64,
}

impl AuditQuery {
    pub fn effective_limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_AUDIT_PAGE,
            n => n.min(MAX_AUDIT_PAGE),
        }
    }
}

/// Append one event on `conn`. Payloads are redacted before they are stored.
pub(crate) fn insert_event(
    conn: &Connection,
    ev: NewAuditEvent,
    now: DateTime<Utc>,
) -> Result<AuditEvent> {
    let payload = tollgate_events::redact(&ev.payload);
    let created = format_ts(&now);
    conn.execute(
        "INSERT INTO audit_events(event_type,run_id,changeset_id,actor,repo,reason_code,payload,created_at) VALUES(?,?,?,?,?,?,?,?)",
        params![
            ev.event_type,
            ev.run_id,
            ev.changeset_id,
            ev.actor,
            ev.repo,
            ev.reason_code.map(|c| c.as_str()),
            serde_json::to_string(&payload)?,
            created,
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::trace!(target: "kernel", id, kind = ev.event_type, "audit appended");
    Ok(AuditEvent {
        id,
        event_type: ev.event_type.to_string(),
        run_id: ev.run_id,
        changeset_id: ev.changeset_id,
        actor: ev.actor,
        repo: ev.repo,
        reason_code: ev.reason_code.map(|c| c.as_str().to_string()),
        payload,
        created_at: now,
    })
}

impl Kernel {
    /// Append a standalone audit event (denials, rejected attempts, faults).
    pub fn append_audit(&self, ev: NewAuditEvent, now: DateTime<Utc>) -> Result<AuditEvent> {
        let conn = self.conn()?;
        insert_event(&conn, ev, now)
    }

    /// Events matching `q`, ascending by id.
    pub fn query_audit(&self, q: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(v) = &q.run_id {
            clauses.push("run_id=?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &q.changeset_id {
            clauses.push("changeset_id=?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &q.event_type {
            clauses.push("event_type=?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &q.repo {
            clauses.push("repo=?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &q.actor {
            clauses.push("actor=?");
            args.push(Box::new(v.clone()));
        }
        if let Some(v) = &q.start {
            clauses.push("created_at>=?");
            args.push(Box::new(format_ts(v)));
        }
        if let Some(v) = &q.end {
            clauses.push("created_at<?");
            args.push(Box::new(format_ts(v)));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {AUDIT_COLS} FROM audit_events {filter} ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        args.push(Box::new(q.effective_limit() as i64));
        args.push(Box::new(q.offset as i64));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), AuditEvent::from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn query_audit_async(&self, q: AuditQuery) -> Result<Vec<AuditEvent>> {
        self.call(move |k| k.query_audit(&q)).await
    }
}
