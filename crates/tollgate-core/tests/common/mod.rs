#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use tempfile::TempDir;
use tollgate_core::{ManualClock, Orchestrator, OrchestratorConfig, ProposeAgentRun, ProposeChangeset};
use tollgate_kernel::{AuditEvent, AuditQuery, Kernel};
use tollgate_mock_adapter::ScriptedAdapter;
use tollgate_policy::{ActorContext, ActorKind};
use tollgate_protocol::Budgets;
use tollgate_runtime::AdapterRegistry;

pub const CHANGESET_ADAPTER: &str = "github";
pub const RUN_ADAPTER: &str = "agent";

pub struct Harness {
    pub engine: Orchestrator,
    pub clock: Arc<ManualClock>,
    /// Applies changesets; reports the created binding on its first poll.
    pub github: Arc<ScriptedAdapter>,
    /// Runs agent jobs through submit/poll.
    pub agent: Arc<ScriptedAdapter>,
    _dir: TempDir,
}

/// Relaxed posture, fast polling, two retries.
pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tune: impl FnOnce(&mut OrchestratorConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = OrchestratorConfig::default();
    cfg.policy.posture = "relaxed".into();
    cfg.retry.max_retries = 2;
    cfg.adapters.changeset_adapter = CHANGESET_ADAPTER.into();
    cfg.adapters.poll_interval_ms = 5;
    cfg.worker.poll_interval_ms = 10;
    cfg.budgets.max_total_tokens = 10_000;
    cfg.budgets.max_tool_calls = 20;
    cfg.budgets.max_wall_seconds = 600;
    tune(&mut cfg);

    let kernel = Kernel::open(dir.path()).expect("open kernel");
    let github = Arc::new(ScriptedAdapter::new(CHANGESET_ADAPTER));
    let agent = Arc::new(ScriptedAdapter::new(RUN_ADAPTER));
    let mut adapters = AdapterRegistry::default();
    adapters.register(github.clone());
    adapters.register(agent.clone());
    let clock = Arc::new(ManualClock::default());
    let engine = Orchestrator::new(cfg, kernel, adapters, clock.clone()).expect("engine");
    Harness {
        engine,
        clock,
        github,
        agent,
        _dir: dir,
    }
}

impl Harness {
    /// Move past any scheduled backoff.
    pub fn skip_backoff(&self) {
        self.clock.advance(Duration::minutes(5));
    }

    pub async fn audit_for_changeset(&self, id: &str) -> Vec<AuditEvent> {
        self.engine
            .query_audit(AuditQuery {
                changeset_id: Some(id.to_string()),
                limit: 500,
                ..Default::default()
            })
            .await
            .expect("audit query")
    }

    pub async fn audit_for_run(&self, run_id: &str) -> Vec<AuditEvent> {
        self.engine
            .query_audit(AuditQuery {
                run_id: Some(run_id.to_string()),
                limit: 500,
                ..Default::default()
            })
            .await
            .expect("audit query")
    }

    pub async fn audit_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.engine
            .query_audit(AuditQuery {
                event_type: Some(event_type.to_string()),
                limit: 500,
                ..Default::default()
            })
            .await
            .expect("audit query")
    }

    /// Propose and approve a run, returning its id.
    pub async fn approved_run(&self, spec: ProposeAgentRun) -> String {
        let proposed = self
            .engine
            .propose_agent_run(spec, &human("alice"))
            .await
            .expect("propose run");
        self.engine
            .approve_agent_run(&proposed.entity.run_id, &human("bob"))
            .await
            .expect("approve run");
        proposed.entity.run_id
    }
}

pub fn human(name: &str) -> ActorContext {
    ActorContext::human(name).with_write_token(true)
}

pub fn agent_actor(name: &str) -> ActorContext {
    ActorContext {
        actor: name.into(),
        kind: ActorKind::Agent,
        has_write_token: false,
        roles: Vec::new(),
    }
}

pub fn changeset(op: &str, payload: serde_json::Value) -> ProposeChangeset {
    ProposeChangeset {
        operation: op.into(),
        repo: "org/repo".into(),
        binding: None,
        payload,
        idempotency_key: None,
        bundle_id: None,
        max_retries: None,
    }
}

pub fn run_spec(goal: &str) -> ProposeAgentRun {
    ProposeAgentRun {
        goal: goal.into(),
        model: "stub-1".into(),
        repo: None,
        budgets: Budgets {
            max_total_tokens: 1_000,
            max_tool_calls: 5,
            max_wall_seconds: 60,
        },
        tools_allowed: vec!["github_read".into()],
        adapter_name: RUN_ADAPTER.into(),
        env: BTreeMap::new(),
        idempotency_key: None,
        max_retries: None,
    }
}
