//! Orchestration engine for approval-gated external writes and agent runs.
//!
//! [`Orchestrator`] owns the changeset and agent-run state machines. All
//! coordination state lives in the [`Kernel`] store, so any number of
//! engines (one per worker process) can share a state directory; this type
//! only adds policy, retry decisions, adapter dispatch and cancellation of
//! in-flight adapter calls.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tollgate_events::Bus;
use tollgate_kernel::{AuditEvent, AuditQuery, Kernel, NewAuditEvent};
use tollgate_policy::PolicyGate;
use tollgate_protocol::ReasonCode;
use tollgate_runtime::AdapterRegistry;

pub mod audit;
mod changesets;
pub mod clock;
pub mod config;
mod error;
mod execute;
pub mod retry;
mod runs;
mod worker;

pub use audit::{replay_status, AuditLog};
pub use changesets::{BundleReport, ProposeChangeset};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{EngineError, EngineResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use runs::{ProposeAgentRun, CREDENTIAL_ENV_KEYS};
pub use worker::{Tick, Worker};

/// Result of a propose call.
#[derive(Debug, Clone)]
pub struct Proposal<T> {
    pub entity: T,
    /// The key already pointed at a live entity; nothing new was created.
    pub deduplicated: bool,
    /// Id of the terminally failed entity this proposal replaced.
    pub superseded: Option<String>,
}

struct Inner {
    kernel: Kernel,
    gate: PolicyGate,
    adapters: AdapterRegistry,
    retry: RetryPolicy,
    cfg: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    audit: AuditLog,
    /// Write credential available to the changeset executor.
    write_token: AtomicBool,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("db", &self.inner.kernel.db_path())
            .field("adapters", &self.inner.adapters)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        kernel: Kernel,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        cfg.leases.validate()?;
        let gate = PolicyGate::new(cfg.policy.clone())?;
        let retry = RetryPolicy::from_config(&cfg.retry);
        let audit = AuditLog::new(kernel.clone(), Bus::default());
        tracing::debug!(
            target: "kernel",
            adapters = ?adapters.names(),
            policy = %gate.snapshot(),
            "orchestrator ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                kernel,
                gate,
                adapters,
                retry,
                cfg,
                clock,
                audit,
                write_token: AtomicBool::new(false),
                inflight: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Open the configured state directory with the built-in adapters the
    /// configuration enables and the system clock.
    pub fn from_config(cfg: OrchestratorConfig) -> anyhow::Result<Self> {
        let kernel = Kernel::open(&cfg.storage.state_dir())?;
        let adapters = AdapterRegistry::from_kinds(&cfg.adapters.kinds()?);
        let engine = Self::new(cfg, kernel, adapters, Arc::new(SystemClock))?;
        engine.set_write_token(config::write_token_present());
        Ok(engine)
    }

    /// Declare whether the changeset executor holds a write credential.
    pub fn set_write_token(&self, present: bool) {
        self.inner.write_token.store(present, Ordering::Relaxed);
    }

    pub(crate) fn has_write_token(&self) -> bool {
        self.inner.write_token.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.cfg
    }

    pub fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    pub fn bus(&self) -> &Bus {
        self.inner.audit.bus()
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.inner.gate
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Audit events matching `q`, ascending by id.
    pub async fn query_audit(&self, q: AuditQuery) -> EngineResult<Vec<AuditEvent>> {
        match self.inner.audit.query(q).await {
            Ok(events) => Ok(events),
            Err(err) => Err(self.fault("system", err).await),
        }
    }

    /// Run a blocking store call, converting failure into an audited fault.
    async fn store<T, F>(&self, actor: &str, f: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Kernel) -> anyhow::Result<T> + Send + 'static,
    {
        match self.inner.kernel.call(f).await {
            Ok(v) => Ok(v),
            Err(err) => Err(self.fault(actor, err).await),
        }
    }

    /// Append an audit event outside a state transition.
    async fn record(&self, ev: NewAuditEvent) -> EngineResult<AuditEvent> {
        let actor = ev.actor.clone();
        match self.inner.audit.append(ev, self.now()).await {
            Ok(stored) => Ok(stored),
            Err(err) => Err(self.fault(&actor, err).await),
        }
    }

    /// Refuse lease lengths outside `1..=max_lease_seconds`.
    fn check_lease(&self, lease_seconds: u64) -> EngineResult<()> {
        let leases = &self.config().leases;
        if leases.admits(lease_seconds) {
            return Ok(());
        }
        Err(EngineError::validation(
            ReasonCode::ValidationFailed,
            format!(
                "lease_seconds must be between 1 and {}, got {lease_seconds}",
                leases.max_lease_seconds
            ),
        ))
    }

    /// Audit an unexpected fault and wrap it for the caller.
    async fn fault(&self, actor: &str, err: anyhow::Error) -> EngineError {
        tracing::error!(target: "kernel", actor, error = %err, "internal fault");
        let ev = NewAuditEvent::new(tollgate_topics::INTERNAL_ERROR, actor)
            .reason(ReasonCode::InternalError)
            .with(json!({ "error": err.to_string() }));
        if let Err(audit_err) = self.inner.audit.append(ev, self.now()).await {
            tracing::error!(target: "kernel", error = %audit_err, "could not audit internal fault");
        }
        EngineError::Internal(err)
    }

    /// Register an interruptible unit of work. Call only once the caller
    /// holds the entity's lease. An existing registration is never replaced:
    /// a second caller gets a detached handle that cancel cannot reach. The
    /// entry is removed when the guard that owns it drops.
    fn track_inflight(&self, entity_id: &str) -> InflightGuard {
        let notify = Arc::new(Notify::new());
        match self.inflight_map().entry(entity_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(notify.clone());
            }
            Entry::Occupied(_) => {
                tracing::warn!(
                    target: "kernel",
                    entity_id,
                    "entity already in flight; new attempt is not cancellable"
                );
            }
        }
        InflightGuard {
            engine: self.clone(),
            entity_id: entity_id.to_string(),
            notify,
        }
    }

    /// Wake an in-flight adapter call for `entity_id`, if any.
    fn interrupt(&self, entity_id: &str) -> bool {
        match self.inflight_map().get(entity_id) {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    fn inflight_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Notify>>> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct InflightGuard {
    engine: Orchestrator,
    entity_id: String,
    notify: Arc<Notify>,
}

impl InflightGuard {
    pub(crate) fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut map = self.engine.inflight_map();
        if map
            .get(&self.entity_id)
            .is_some_and(|n| Arc::ptr_eq(n, &self.notify))
        {
            map.remove(&self.entity_id);
        }
    }
}
