//! Idempotency index: maps an intent key to the entity currently answering it.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::format_ts;

pub(crate) const KIND_CHANGESET: &str = "changeset";
pub(crate) const KIND_AGENT_RUN: &str = "agent_run";

/// `<op>:<target>:<intent-fingerprint>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Deterministic key for an intent: identical inputs always derive the
    /// same key regardless of object key order in `payload`.
    pub fn derive(operation: &str, target: &str, payload: &Value) -> Self {
        let fp = fingerprint(payload);
        Self(format!("{operation}:{target}:{}", &fp[..16]))
    }

    pub fn explicit(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex sha256 of the canonical JSON encoding (sorted object keys).
pub fn fingerprint(payload: &Value) -> String {
    let mut canon = String::new();
    write_canonical(payload, &mut canon);
    let digest = Sha256::digest(canon.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// What a propose call should do with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Create,
    /// Return the existing entity unchanged.
    Reuse(String),
    /// Create a new entity and retire this terminally failed one.
    Supersede(String),
}

/// Decide between reuse and supersession for an existing entity.
pub fn resolve(
    existing_id: &str,
    existing_terminal_failure: bool,
    existing_fingerprint: &str,
    incoming_fingerprint: &str,
) -> Resolution {
    if existing_terminal_failure && existing_fingerprint != incoming_fingerprint {
        Resolution::Supersede(existing_id.to_string())
    } else {
        Resolution::Reuse(existing_id.to_string())
    }
}

pub(crate) fn lookup(conn: &Connection, kind: &str, key: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT entity_id FROM idempotency_keys WHERE entity_kind=? AND key=?",
            params![kind, key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn point(
    conn: &Connection,
    kind: &str,
    key: &str,
    entity_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO idempotency_keys(entity_kind,key,entity_id,updated_at) VALUES(?,?,?,?)
         ON CONFLICT(entity_kind,key) DO UPDATE SET entity_id=excluded.entity_id, updated_at=excluded.updated_at",
        params![kind, key, entity_id, format_ts(&now)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_ignores_object_key_order() {
        let a = IdempotencyKey::derive("add_labels", "org/repo", &json!({"issue": 4, "labels": ["x"]}));
        let b = IdempotencyKey::derive("add_labels", "org/repo", &json!({"labels": ["x"], "issue": 4}));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("add_labels:org/repo:"));
        assert_eq!(a.as_str().len(), "add_labels:org/repo:".len() + 16);
    }

    #[test]
    fn derive_changes_with_intent() {
        let a = IdempotencyKey::derive("create_issue", "org/repo", &json!({"title": "a"}));
        let b = IdempotencyKey::derive("create_issue", "org/repo", &json!({"title": "b"}));
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_supersedes_only_changed_terminal_failures() {
        assert_eq!(resolve("cs-1", false, "f1", "f2"), Resolution::Reuse("cs-1".into()));
        assert_eq!(resolve("cs-1", true, "f1", "f1"), Resolution::Reuse("cs-1".into()));
        assert_eq!(
            resolve("cs-1", true, "f1", "f2"),
            Resolution::Supersede("cs-1".into())
        );
    }
}
