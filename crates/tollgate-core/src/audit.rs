use chrono::{DateTime, Utc};
use serde_json::json;
use tollgate_events::{Bus, Envelope};
use tollgate_kernel::{format_ts, AuditEvent, AuditQuery, Kernel, NewAuditEvent};

/// Durable audit log plus its live fan-out.
#[derive(Clone)]
pub struct AuditLog {
    kernel: Kernel,
    bus: Bus,
}

impl AuditLog {
    pub fn new(kernel: Kernel, bus: Bus) -> Self {
        Self { kernel, bus }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Publish already-committed events to bus subscribers.
    pub fn publish(&self, events: &[AuditEvent]) {
        for ev in events {
            self.bus.publish(Envelope {
                id: ev.id,
                time: format_ts(&ev.created_at),
                kind: ev.event_type.clone(),
                payload: json!({
                    "run_id": ev.run_id,
                    "changeset_id": ev.changeset_id,
                    "actor": ev.actor,
                    "repo": ev.repo,
                    "reason_code": ev.reason_code,
                    "payload": ev.payload,
                }),
            });
        }
    }

    pub async fn append(&self, ev: NewAuditEvent, now: DateTime<Utc>) -> anyhow::Result<AuditEvent> {
        let stored = self.kernel.call(move |k| k.append_audit(ev, now)).await?;
        self.publish(std::slice::from_ref(&stored));
        Ok(stored)
    }

    pub async fn query(&self, q: AuditQuery) -> anyhow::Result<Vec<AuditEvent>> {
        self.kernel.query_audit_async(q).await
    }
}

/// Final status of an entity according to its audit trail: the `to` of the
/// last event that recorded a transition.
pub fn replay_status(events: &[AuditEvent]) -> Option<String> {
    events
        .iter()
        .rev()
        .find_map(|ev| ev.to_status().map(str::to_string))
}
