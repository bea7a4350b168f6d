//! Durable coordination state for the orchestrator.
//!
//! All shared mutable state (changesets, agent runs, their leases, the
//! idempotency index and the audit log) lives in one SQLite database. Every
//! state change is a single `BEGIN IMMEDIATE` transaction that checks the
//! expected current state, applies the update and appends its audit event, so
//! concurrent workers in any number of processes serialize on the database
//! rather than on in-memory locks.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};

mod audit;
mod changesets;
pub mod idempotency;
mod rows;
mod runs;

pub use audit::{AuditQuery, MAX_AUDIT_PAGE};
pub use idempotency::{fingerprint, IdempotencyKey, Resolution};
pub use rows::{
    AgentRunRow, AuditEvent, ChangesetPatch, ChangesetRow, LeaseGuard, NewAgentRun, NewAuditEvent,
    NewChangeset, ProposeResult, Recorded, RunPatch, Transition,
};

pub const DB_FILE: &str = "tollgate.sqlite";

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_ms: u64,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        // Busy timeout (default 5000ms; override with TOLLGATE_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("TOLLGATE_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self { db_path, busy_ms };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(target: "kernel", path = %kernel.db_path.display(), "opened store");
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS changesets (
              id TEXT PRIMARY KEY,
              bundle_id TEXT,
              idempotency_key TEXT NOT NULL,
              intent_fingerprint TEXT NOT NULL,
              operation TEXT NOT NULL,
              category INTEGER NOT NULL,
              repo TEXT NOT NULL,
              binding TEXT,
              payload TEXT NOT NULL,
              status TEXT NOT NULL,
              requires_approval INTEGER NOT NULL DEFAULT 1,
              created_by TEXT NOT NULL,
              approved_by TEXT,
              approved_at TEXT,
              reason_code TEXT,
              last_error TEXT,
              retry_count INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL,
              next_attempt_at TEXT,
              claimed_by TEXT,
              claim_expires_at TEXT,
              job_id TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_changesets_status ON changesets(status);
            CREATE INDEX IF NOT EXISTS idx_changesets_bundle ON changesets(bundle_id);
            CREATE INDEX IF NOT EXISTS idx_changesets_key ON changesets(idempotency_key);

            CREATE TABLE IF NOT EXISTS agent_runs (
              run_id TEXT PRIMARY KEY,
              idempotency_key TEXT NOT NULL,
              intent_fingerprint TEXT NOT NULL,
              goal TEXT NOT NULL,
              model TEXT NOT NULL,
              repo TEXT,
              budgets TEXT NOT NULL,
              tools_allowed TEXT NOT NULL,
              adapter_name TEXT NOT NULL,
              status TEXT NOT NULL,
              status_reason TEXT,
              created_by TEXT NOT NULL,
              approved_by TEXT,
              claimed_by TEXT,
              claim_expires_at TEXT,
              retry_count INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL,
              next_attempt_at TEXT,
              last_error TEXT,
              job_id TEXT,
              artifact_paths TEXT NOT NULL DEFAULT '[]',
              env TEXT NOT NULL DEFAULT '{}',
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON agent_runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_adapter ON agent_runs(adapter_name);

            -- Append-only: rows are inserted, never updated or deleted
            CREATE TABLE IF NOT EXISTS audit_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_type TEXT NOT NULL,
              run_id TEXT,
              changeset_id TEXT,
              actor TEXT NOT NULL,
              repo TEXT,
              reason_code TEXT,
              payload TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_type ON audit_events(event_type);
            CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_events(run_id);
            CREATE INDEX IF NOT EXISTS idx_audit_changeset ON audit_events(changeset_id);
            CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_events(created_at);

            CREATE TABLE IF NOT EXISTS idempotency_keys (
              entity_kind TEXT NOT NULL,   -- changeset | agent_run
              key TEXT NOT NULL,
              entity_id TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (entity_kind, key)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(self.busy_ms))?;
        Ok(conn)
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    fn write_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Async bridge (spawn_blocking) ----------------
    // rusqlite is synchronous; async callers offload through here.

    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Kernel) -> Result<T> + Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(&k))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

pub fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// End of a lease of `lease_seconds` starting at `now`. Zero-length leases
/// and lengths that do not fit the calendar are errors.
pub fn lease_expiry(now: DateTime<Utc>, lease_seconds: u64) -> Result<DateTime<Utc>> {
    if lease_seconds == 0 {
        return Err(anyhow!("lease_seconds must be positive"));
    }
    i64::try_from(lease_seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|len| now.checked_add_signed(len))
        .ok_or_else(|| anyhow!("lease_seconds {lease_seconds} is out of range"))
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_slug<T>(
    idx: usize,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognised value {raw:?}").into(),
        )
    })
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// `'a','b'` list for an `IN (...)` clause built from fixed status slugs.
pub(crate) fn in_list<'a>(slugs: impl IntoIterator<Item = &'a str>) -> String {
    slugs
        .into_iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Column assignments for a dynamic `UPDATE ... SET`.
#[derive(Default)]
pub(crate) struct Assignments {
    cols: Vec<String>,
    vals: Vec<Box<dyn rusqlite::ToSql>>,
}

impl Assignments {
    pub(crate) fn set<V: rusqlite::ToSql + 'static>(&mut self, col: &str, value: V) {
        self.cols.push(format!("{col}=?"));
        self.vals.push(Box::new(value));
    }

    pub(crate) fn set_null(&mut self, col: &str) {
        self.cols.push(format!("{col}=NULL"));
    }

    /// Executes `UPDATE table SET ... WHERE key_col = key`.
    pub(crate) fn apply(
        mut self,
        conn: &Connection,
        table: &str,
        key_col: &str,
        key: &str,
    ) -> Result<usize> {
        if self.cols.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {table} SET {} WHERE {key_col}=?",
            self.cols.join(", ")
        );
        self.vals.push(Box::new(key.to_string()));
        let n = conn.execute(&sql, rusqlite::params_from_iter(self.vals.iter()))?;
        Ok(n)
    }
}
