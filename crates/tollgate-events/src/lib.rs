use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Payload keys whose values never leave the process unredacted.
pub const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "authorization",
    "password",
    "private_key",
    "secret",
    "token",
];

pub const REDACTED: &str = "[REDACTED]";

/// Live audit envelope (RFC3339 time). `id` mirrors the durable audit row.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Broadcast bus used to tail audit events in-process.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, env: Envelope) {
        // No receivers is the common case outside the CLI tail.
        if self.tx.send(env).is_err() {
            tracing::trace!(target: "events", "no bus subscribers");
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&lower.as_str())
}

/// Replace sensitive values at any depth.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                let v = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    redact(val)
                };
                out.insert(key.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        _ => value.clone(),
    }
}
