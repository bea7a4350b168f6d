mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use common::{agent_actor, harness, harness_with, human, run_spec};
use tollgate_core::{replay_status, EngineError};
use tollgate_kernel::{LeaseGuard, NewAuditEvent, RunPatch, Transition};
use tollgate_mock_adapter::PollStep;
use tollgate_protocol::{ReasonCode, RunStatus};
use tollgate_runtime::{AdapterError, JobState, PollReport, Usage};

const WORKER: &str = "worker-a";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_a_run_to_exactly_one_worker() {
    let h = harness();
    let run_id = h.approved_run(run_spec("triage")).await;

    let a = h.engine.clone();
    let b = h.engine.clone();
    let (left, right) = tokio::join!(
        tokio::spawn(async move { a.claim_agent_runs("worker-a", 1, 60).await }),
        tokio::spawn(async move { b.claim_agent_runs("worker-b", 1, 60).await }),
    );
    let left = left.expect("join a").expect("claim a");
    let right = right.expect("join b").expect("claim b");
    assert_eq!(left.len() + right.len(), 1, "exactly one claim succeeds");
    let winner = left.iter().chain(right.iter()).next().expect("winner");
    assert_eq!(winner.run_id, run_id);
    assert_eq!(winner.status, RunStatus::Approved, "claiming leaves the run approved");
}

#[tokio::test]
async fn executing_an_unclaimed_run_is_refused() {
    let h = harness();
    let run_id = h.approved_run(run_spec("triage")).await;

    let err = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect_err("execute without lease");
    assert!(matches!(err, EngineError::NotClaimed { .. }));
    assert_eq!(err.reason_code(), ReasonCode::NotClaimed);
    let row = h.engine.get_agent_run(&run_id).await.expect("get");
    assert_eq!(row.status, RunStatus::Approved);
    assert_eq!(h.agent.submit_calls().await, 0);

    let refusals = h.audit_of_type(tollgate_topics::TRANSITION_REJECTED).await;
    assert_eq!(refusals.len(), 1);
    assert_eq!(refusals[0].reason_code.as_deref(), Some("not_claimed"));
}

#[tokio::test]
async fn completed_runs_record_artifacts_after_approval() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Running {
            usage: Usage {
                total_tokens: 120,
                tool_calls: 2,
            },
            requested_tools: vec!["github_read".into()],
        })
        .await;
    h.agent.set_artifacts(vec!["out/summary.md".into()]).await;
    let run_id = h.approved_run(run_spec("summarise open issues")).await;

    let claimed = h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    assert_eq!(claimed.len(), 1);
    let row = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect("execute");
    assert_eq!(row.status, RunStatus::Completed);
    assert_eq!(row.artifact_paths, vec!["out/summary.md".to_string()]);
    assert_eq!(row.job_id.as_deref(), Some(format!("agent:{run_id}#1").as_str()));
    assert!(row.claimed_by.is_none());

    let trail = h.audit_for_run(&run_id).await;
    let kinds: Vec<&str> = trail.iter().map(|e| e.event_type.as_str()).collect();
    let approved_at = kinds
        .iter()
        .position(|k| *k == tollgate_topics::AGENT_RUN_APPROVED)
        .expect("approval audited");
    let started_at = kinds
        .iter()
        .position(|k| *k == tollgate_topics::AGENT_RUN_STARTED)
        .expect("start audited");
    assert!(approved_at < started_at, "no run starts before approval");
    assert_eq!(replay_status(&trail).as_deref(), Some("completed"));
    let completed = trail.last().expect("last event");
    assert_eq!(completed.event_type, tollgate_topics::AGENT_RUN_COMPLETED);
    assert_eq!(completed.payload["artifact_paths"][0], "out/summary.md");
}

#[tokio::test]
async fn disallowed_tools_fail_the_run_immediately() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Running {
            usage: Usage::default(),
            requested_tools: vec!["github_read".into(), "github_write".into()],
        })
        .await;
    let run_id = h.approved_run(run_spec("label issues")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    let row = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect("execute");

    assert_eq!(row.status, RunStatus::Failed);
    assert_eq!(row.status_reason, Some(ReasonCode::ToolNotAllowed));
    assert_eq!(row.retry_count, 0);
    assert_eq!(h.agent.cancelled_jobs().await.len(), 1, "job cancelled at the executor");
    assert!(h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim").is_empty());
}

#[tokio::test]
async fn usage_over_budget_fails_the_run() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Running {
            usage: Usage {
                total_tokens: 5_000,
                tool_calls: 1,
            },
            requested_tools: Vec::new(),
        })
        .await;
    let run_id = h.approved_run(run_spec("burn tokens")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    let row = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect("execute");
    assert_eq!(row.status, RunStatus::Failed);
    assert_eq!(row.status_reason, Some(ReasonCode::BudgetExceeded));
}

#[tokio::test]
async fn wall_time_is_enforced_while_polling() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Stall(StdDuration::from_secs(30)))
        .await;
    let mut spec = run_spec("slow");
    spec.budgets.max_wall_seconds = 1;
    let run_id = h.approved_run(spec).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    let row = tokio::time::timeout(
        StdDuration::from_secs(10),
        h.engine.execute_agent_run(&run_id, WORKER),
    )
    .await
    .expect("wall clock bound")
    .expect("execute");
    assert_eq!(row.status, RunStatus::Failed);
    assert_eq!(row.status_reason, Some(ReasonCode::WallTimeExceeded));
}

#[tokio::test]
async fn executor_reported_failures_keep_their_reason() {
    let h = harness();
    let mut report = PollReport::state(JobState::Failed);
    report.reason_code = Some(ReasonCode::ValidationFailed);
    report.message = Some("model refused the goal".into());
    h.agent.push_poll(PollStep::Finish(report)).await;
    let run_id = h.approved_run(run_spec("bad goal")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    let row = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect("execute");
    assert_eq!(row.status, RunStatus::Failed);
    assert_eq!(row.status_reason, Some(ReasonCode::ValidationFailed));
    assert_eq!(row.last_error.as_deref(), Some("model refused the goal"));
}

#[tokio::test]
async fn transient_failures_retry_then_exhaust() {
    let h = harness();
    h.agent
        .fail_submits(3, AdapterError::RateLimited { retry_after: None })
        .await;
    let run_id = h.approved_run(run_spec("flaky upstream")).await;

    for attempt in 1..=3u32 {
        let claimed = h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
        assert_eq!(claimed.len(), 1, "attempt {attempt} should be claimable");
        let row = h
            .engine
            .execute_agent_run(&run_id, WORKER)
            .await
            .expect("execute");
        if attempt < 3 {
            assert_eq!(row.status, RunStatus::Approved, "retry returns to the queue");
            assert_eq!(row.retry_count, attempt);
            assert_eq!(row.status_reason, Some(ReasonCode::RateLimited));
            assert!(row.claimed_by.is_none());
            h.skip_backoff();
        } else {
            assert_eq!(row.status, RunStatus::Failed);
            assert_eq!(row.retry_count, 2);
            assert_eq!(row.status_reason, Some(ReasonCode::RetryBudgetExhausted));
        }
    }
    assert_eq!(h.agent.submit_calls().await, 3);
    assert_eq!(
        h.audit_of_type(tollgate_topics::RETRY_BUDGET_EXHAUSTED).await.len(),
        1
    );
}

#[tokio::test]
async fn reapproving_a_failed_run_restores_its_retry_budget() {
    let h = harness();
    h.agent
        .fail_submits(3, AdapterError::Unavailable { status: 503, retry_after: None })
        .await;
    let run_id = h.approved_run(run_spec("flaky")).await;
    for _ in 0..3 {
        h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
        h.engine.execute_agent_run(&run_id, WORKER).await.expect("execute");
        h.skip_backoff();
    }
    let row = h
        .engine
        .transition_agent_run(&run_id, RunStatus::Approved, None, &human("bob"))
        .await
        .expect("re-approve");
    assert_eq!(row.status, RunStatus::Approved);
    assert_eq!(row.retry_count, 0);
    assert!(row.status_reason.is_none());

    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");
    let row = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect("execute");
    assert_eq!(row.status, RunStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_run_interrupts_it() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Stall(StdDuration::from_secs(30)))
        .await;
    let run_id = h.approved_run(run_spec("long task")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");

    let engine = h.engine.clone();
    let id = run_id.clone();
    let task = tokio::spawn(async move { engine.execute_agent_run(&id, WORKER).await });
    let mut waited = 0;
    loop {
        let row = h.engine.get_agent_run(&run_id).await.expect("get");
        if row.status == RunStatus::Running {
            break;
        }
        waited += 1;
        assert!(waited < 500, "run never started");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    let cancelled = h
        .engine
        .cancel_agent_run(&run_id, "bob")
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.status_reason, Some(ReasonCode::Cancelled));

    let finished = tokio::time::timeout(StdDuration::from_secs(5), task)
        .await
        .expect("execution interrupted")
        .expect("join")
        .expect("execute result");
    assert_eq!(finished.status, RunStatus::Cancelled);

    let err = h
        .engine
        .execute_agent_run(&run_id, WORKER)
        .await
        .expect_err("execute after cancel");
    assert_eq!(err.reason_code(), ReasonCode::InvalidTransition);
    assert_eq!(
        replay_status(&h.audit_for_run(&run_id).await).as_deref(),
        Some("cancelled")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_executes_leave_the_holder_cancellable() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Stall(StdDuration::from_secs(30)))
        .await;
    let run_id = h.approved_run(run_spec("long task")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");

    let engine = h.engine.clone();
    let id = run_id.clone();
    let task = tokio::spawn(async move { engine.execute_agent_run(&id, WORKER).await });
    let mut waited = 0;
    while h.agent.poll_calls().await == 0 {
        waited += 1;
        assert!(waited < 500, "job never polled");
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    for intruder in ["worker-b", WORKER] {
        let err = h
            .engine
            .execute_agent_run(&run_id, intruder)
            .await
            .expect_err("second execute");
        assert_eq!(err.reason_code(), ReasonCode::InvalidTransition, "{intruder}");
    }
    assert_eq!(h.agent.submit_calls().await, 1);

    h.engine
        .cancel_agent_run(&run_id, "bob")
        .await
        .expect("cancel");
    let finished = tokio::time::timeout(StdDuration::from_secs(5), task)
        .await
        .expect("holder interrupted")
        .expect("join")
        .expect("execute result");
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert_eq!(
        h.agent.cancelled_jobs().await,
        vec![format!("agent:{run_id}#1")],
        "job cancelled at the executor"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_lost_lease_abandons_the_job_and_names_it() {
    let h = harness();
    h.agent
        .push_poll(PollStep::Stall(StdDuration::from_millis(300)))
        .await;
    let run_id = h.approved_run(run_spec("slow poll")).await;
    h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim");

    let engine = h.engine.clone();
    let id = run_id.clone();
    let task = tokio::spawn(async move { engine.execute_agent_run(&id, WORKER).await });
    let mut waited = 0;
    while h.agent.poll_calls().await == 0 {
        waited += 1;
        assert!(waited < 500, "job never polled");
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    // The next heartbeat lands after the lease has lapsed.
    h.clock.advance(Duration::minutes(10));

    let err = tokio::time::timeout(StdDuration::from_secs(5), task)
        .await
        .expect("execution stops")
        .expect("join")
        .expect_err("lease lost");
    assert_eq!(err.reason_code(), ReasonCode::NotClaimed);
    let job_id = format!("agent:{run_id}#1");
    assert_eq!(h.agent.cancelled_jobs().await, vec![job_id.clone()]);

    let refusals = h.audit_of_type(tollgate_topics::TRANSITION_REJECTED).await;
    assert_eq!(refusals.len(), 1);
    assert_eq!(refusals[0].run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(refusals[0].payload["job_id"], job_id.as_str());
    assert_eq!(refusals[0].payload["attempted"], "completed");
}

#[tokio::test]
async fn lease_lengths_outside_bounds_are_rejected() {
    let h = harness_with(|cfg| cfg.leases.max_lease_seconds = 3_600);
    let run_id = h.approved_run(run_spec("bounded lease")).await;

    for lease in [0, 3_601, 1 << 63, u64::MAX] {
        let err = h
            .engine
            .claim_agent_runs(WORKER, 1, lease)
            .await
            .expect_err("lease out of bounds");
        assert!(matches!(err, EngineError::Validation { .. }), "{lease}");
        assert_eq!(err.reason_code(), ReasonCode::ValidationFailed);
    }
    let row = h.engine.get_agent_run(&run_id).await.expect("get");
    assert!(row.claimed_by.is_none(), "nothing was leased");

    let claimed = h
        .engine
        .claim_agent_runs("worker-b", 1, 3_600)
        .await
        .expect("claim at the ceiling");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("worker-b"));
    assert!(h.engine.claim_agent_runs(WORKER, 1, u64::MAX).await.is_err());
    assert!(
        h.engine.claim_agent_runs(WORKER, 1, 60).await.expect("claim").is_empty(),
        "a live lease is never handed out twice"
    );
}

#[tokio::test]
async fn expired_leases_are_reaped_and_reclaimed() {
    let h = harness();
    let run_id = h.approved_run(run_spec("crashy worker")).await;
    h.engine.claim_agent_runs("worker-dead", 1, 30).await.expect("claim");

    // Simulate a worker that entered `running` and then vanished.
    let now = h.engine.now();
    let id = run_id.clone();
    let started = h
        .engine
        .kernel()
        .call(move |k| {
            k.transition_run(
                &id,
                &[RunStatus::Approved],
                RunStatus::Running,
                LeaseGuard::Live {
                    worker_id: "worker-dead".into(),
                    now,
                },
                RunPatch::default(),
                NewAuditEvent::new(tollgate_topics::AGENT_RUN_STARTED, "worker-dead"),
                now,
            )
        })
        .await
        .expect("start run");
    assert!(matches!(started, Transition::Done(_)));

    assert!(h.engine.reap_expired_leases().await.expect("reap").is_empty());
    h.clock.advance(Duration::seconds(31));
    let reaped = h.engine.reap_expired_leases().await.expect("reap");
    assert_eq!(reaped.len(), 1);
    let row = &reaped[0];
    assert_eq!(row.status, RunStatus::Approved);
    assert_eq!(row.status_reason, Some(ReasonCode::LeaseExpired));
    assert_eq!(row.retry_count, 1);
    assert!(row.claimed_by.is_none());

    let claimed = h.engine.claim_agent_runs("worker-b", 1, 60).await.expect("claim");
    assert_eq!(claimed.len(), 1);
    let done = h
        .engine
        .execute_agent_run(&run_id, "worker-b")
        .await
        .expect("execute");
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(
        h.audit_of_type(tollgate_topics::AGENT_RUN_LEASE_EXPIRED).await.len(),
        1
    );
}

#[tokio::test]
async fn proposals_outside_limits_are_denied_and_audited() {
    let h = harness();

    let mut leaky = run_spec("leaky");
    leaky.env.insert("GITHUB_TOKEN".into(), "ghp_secret".into());
    leaky.env.insert("LOG_LEVEL".into(), "debug".into());
    let err = h
        .engine
        .propose_agent_run(leaky, &human("alice"))
        .await
        .expect_err("credential env");
    assert_eq!(err.reason_code(), ReasonCode::CredentialForbidden);

    let mut greedy = run_spec("greedy");
    greedy.budgets.max_total_tokens = 1_000_000;
    let err = h
        .engine
        .propose_agent_run(greedy, &human("alice"))
        .await
        .expect_err("over ceiling");
    assert_eq!(err.reason_code(), ReasonCode::BudgetExceeded);

    let mut zero = run_spec("zero");
    zero.budgets.max_tool_calls = 0;
    let err = h
        .engine
        .propose_agent_run(zero, &human("alice"))
        .await
        .expect_err("zero budget");
    assert_eq!(err.reason_code(), ReasonCode::BudgetExceeded);

    let mut nowhere = run_spec("nowhere");
    nowhere.adapter_name = "does_not_exist".into();
    let err = h
        .engine
        .propose_agent_run(nowhere, &human("alice"))
        .await
        .expect_err("unknown adapter");
    assert_eq!(err.reason_code(), ReasonCode::UnknownAdapter);

    let err = h
        .engine
        .propose_agent_run(run_spec("   "), &human("alice"))
        .await
        .expect_err("empty goal");
    assert_eq!(err.reason_code(), ReasonCode::ValidationFailed);

    let denied = h.audit_of_type(tollgate_topics::AGENT_RUN_DENIED).await;
    assert_eq!(denied.len(), 5);
    let first = serde_json::to_string(&denied[0].payload).expect("payload json");
    assert!(first.contains("GITHUB_TOKEN"), "key names are kept");
    assert!(!first.contains("ghp_secret"), "values never reach the audit log");
    let page = h.engine.list_agent_runs(None, 50, 0).await.expect("list");
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn proposals_respect_the_repo_allowlist() {
    let h = harness_with(|cfg| {
        cfg.policy.posture = "standard".into();
        cfg.policy.repo_allowlist = Some(vec!["org/*".into()]);
    });
    let mut spec = run_spec("outside");
    spec.repo = Some("elsewhere/repo".into());
    let err = h
        .engine
        .propose_agent_run(spec, &human("alice"))
        .await
        .expect_err("repo outside allowlist");
    assert_eq!(err.reason_code(), ReasonCode::RepoNotAllowlisted);

    let mut spec = run_spec("inside");
    spec.repo = Some("org/repo".into());
    let ok = h
        .engine
        .propose_agent_run(spec, &tollgate_policy::ActorContext::human("alice"))
        .await
        .expect("proposing a run needs no write token");
    assert_eq!(ok.entity.status, RunStatus::Proposed);
}

#[tokio::test]
async fn identical_run_proposals_deduplicate() {
    let h = harness();
    let a = h
        .engine
        .propose_agent_run(run_spec("triage"), &human("alice"))
        .await
        .expect("propose");
    let b = h
        .engine
        .propose_agent_run(run_spec("triage"), &human("alice"))
        .await
        .expect("propose again");
    assert_eq!(a.entity.run_id, b.entity.run_id);
    assert!(b.deduplicated);
    let c = h
        .engine
        .propose_agent_run(run_spec("something else"), &human("alice"))
        .await
        .expect("different goal");
    assert_ne!(a.entity.run_id, c.entity.run_id);
}

#[tokio::test]
async fn lifecycle_targets_are_not_caller_transitions() {
    let h = harness();
    let run_id = h
        .engine
        .propose_agent_run(run_spec("triage"), &human("alice"))
        .await
        .expect("propose")
        .entity
        .run_id;
    for to in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
        let err = h
            .engine
            .transition_agent_run(&run_id, to, None, &human("bob"))
            .await
            .expect_err("reserved target");
        assert_eq!(err.reason_code(), ReasonCode::InvalidTransition, "{to}");
    }
    let err = h
        .engine
        .transition_agent_run(&run_id, RunStatus::Approved, None, &agent_actor("bot"))
        .await
        .expect_err("agent approval");
    assert_eq!(err.reason_code(), ReasonCode::AuthContextDenied);

    let rejected = h
        .engine
        .transition_agent_run(
            &run_id,
            RunStatus::Rejected,
            Some(ReasonCode::BudgetExceeded),
            &human("bob"),
        )
        .await
        .expect("reject");
    assert_eq!(rejected.status, RunStatus::Rejected);
    assert_eq!(rejected.status_reason, Some(ReasonCode::BudgetExceeded));
    let row = h.engine.get_agent_run(&run_id).await.expect("get");
    assert!(row.approved_by.is_none());
}

#[tokio::test]
async fn unknown_runs_are_reported_not_found() {
    let h = harness();
    let err = h
        .engine
        .cancel_agent_run("missing", "bob")
        .await
        .expect_err("missing run");
    assert!(matches!(err, EngineError::NotFound { .. }));
}
