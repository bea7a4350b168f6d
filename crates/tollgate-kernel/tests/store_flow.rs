use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::{Arc, Barrier};
use tollgate_kernel::{
    fingerprint, AuditQuery, ChangesetPatch, Kernel, LeaseGuard, NewAgentRun, NewAuditEvent,
    NewChangeset, Resolution, RunPatch, Transition,
};
use tollgate_protocol::{Budgets, ChangesetStatus, Operation, ReasonCode, RunStatus};

fn changeset(id: &str, key: &str, op: Operation, bundle: Option<&str>, payload: serde_json::Value) -> NewChangeset {
    NewChangeset {
        id: id.to_string(),
        bundle_id: bundle.map(str::to_string),
        idempotency_key: key.to_string(),
        intent_fingerprint: fingerprint(&payload),
        operation: op,
        repo: "org/repo".into(),
        binding: None,
        payload,
        requires_approval: true,
        created_by: "alice".into(),
        max_retries: 2,
    }
}

fn run(id: &str) -> NewAgentRun {
    NewAgentRun {
        run_id: id.to_string(),
        idempotency_key: format!("propose_agent_run:org/repo:{id}"),
        intent_fingerprint: fingerprint(&json!({"goal": id})),
        goal: "triage".into(),
        model: "stub-1".into(),
        repo: Some("org/repo".into()),
        budgets: Budgets {
            max_total_tokens: 1000,
            max_tool_calls: 5,
            max_wall_seconds: 60,
        },
        tools_allowed: vec!["github_read".into()],
        adapter_name: "provider_stub".into(),
        env: Default::default(),
        created_by: "alice".into(),
        max_retries: 2,
    }
}

fn approve_cs(k: &Kernel, id: &str) {
    let now = Utc::now();
    let out = k
        .transition_changeset(
            id,
            &[ChangesetStatus::Proposed],
            ChangesetStatus::Approved,
            LeaseGuard::None,
            ChangesetPatch {
                approved_by: Some("bob".into()),
                ..Default::default()
            },
            NewAuditEvent::new(tollgate_topics::CHANGESET_APPROVED, "bob"),
            now,
        )
        .expect("approve");
    assert!(matches!(out, Transition::Done(_)));
}

#[test]
fn propose_deduplicates_and_supersedes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    let key = "create_issue:org/repo:feat:x";

    let first = k
        .propose_changeset(changeset("cs-1", key, Operation::CreateIssue, None, json!({"title": "x"})), now)
        .expect("propose");
    assert_eq!(first.resolution, Resolution::Create);
    let again = k
        .propose_changeset(changeset("cs-2", key, Operation::CreateIssue, None, json!({"title": "x"})), now)
        .expect("propose again");
    assert_eq!(again.resolution, Resolution::Reuse("cs-1".into()));
    assert_eq!(again.recorded.value.id, "cs-1");
    assert!(k.get_changeset("cs-2").expect("get").is_none());

    // Reject, then propose with a changed intent under the same key.
    let rejected = k
        .transition_changeset(
            "cs-1",
            &ChangesetStatus::sources_for(ChangesetStatus::Rejected),
            ChangesetStatus::Rejected,
            LeaseGuard::None,
            ChangesetPatch::default(),
            NewAuditEvent::new(tollgate_topics::CHANGESET_REJECTED, "bob"),
            now,
        )
        .expect("reject");
    assert!(matches!(rejected, Transition::Done(_)));
    let changed = k
        .propose_changeset(changeset("cs-3", key, Operation::CreateIssue, None, json!({"title": "y"})), now)
        .expect("supersede");
    assert_eq!(changed.resolution, Resolution::Supersede("cs-1".into()));
    assert_eq!(changed.recorded.value.status, ChangesetStatus::Proposed);
    let old = k.get_changeset("cs-1").expect("get").expect("row");
    assert_eq!(old.status, ChangesetStatus::Superseded);
    assert_eq!(old.reason_code, Some(ReasonCode::Superseded));
}

#[test]
fn invalid_transition_leaves_row_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_changeset(changeset("cs-1", "k1", Operation::AddLabels, None, json!({"labels": ["a"]})), now)
        .expect("propose");
    let out = k
        .transition_changeset(
            "cs-1",
            &[ChangesetStatus::Applying],
            ChangesetStatus::Applied,
            LeaseGuard::None,
            ChangesetPatch::default(),
            NewAuditEvent::new(tollgate_topics::CHANGESET_APPLIED, "w1"),
            now,
        )
        .expect("transition");
    match out {
        Transition::WrongState(row) => assert_eq!(row.status, ChangesetStatus::Proposed),
        other => panic!("unexpected {other:?}"),
    }
    let events = k
        .query_audit(&AuditQuery {
            changeset_id: Some("cs-1".into()),
            ..Default::default()
        })
        .expect("audit");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "changeset_proposed");
}

#[test]
fn bundle_claims_follow_category_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    // Proposed in reverse apply order.
    k.propose_changeset(changeset("dep", "k-dep", Operation::AddDependency, Some("b1"), json!({"on": 1})), now)
        .expect("propose");
    k.propose_changeset(changeset("title", "k-title", Operation::UpdateIssueTitle, Some("b1"), json!({"t": 1})), now)
        .expect("propose");
    k.propose_changeset(changeset("create", "k-create", Operation::CreateIssue, Some("b1"), json!({"c": 1})), now)
        .expect("propose");
    for id in ["dep", "title", "create"] {
        approve_cs(&k, id);
    }

    let first = k.claim_changesets("w1", 10, 60, now, None, Some("b1")).expect("claim");
    let ids: Vec<_> = first.value.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["create"]);
    assert_eq!(first.events.len(), 1);

    // Nothing else is claimable while the create is in flight.
    let blocked = k.claim_changesets("w2", 10, 60, now, None, Some("b1")).expect("claim");
    assert!(blocked.value.is_empty());

    let done = k
        .transition_changeset(
            "create",
            &[ChangesetStatus::Applying],
            ChangesetStatus::Applied,
            LeaseGuard::Live {
                worker_id: "w1".into(),
                now,
            },
            ChangesetPatch {
                release_lease: true,
                ..Default::default()
            },
            NewAuditEvent::new(tollgate_topics::CHANGESET_APPLIED, "w1"),
            now,
        )
        .expect("applied");
    assert!(matches!(done, Transition::Done(_)));
    let next = k.claim_changesets("w1", 10, 60, now, None, Some("b1")).expect("claim");
    let ids: Vec<_> = next.value.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["title"]);
}

#[test]
fn concurrent_run_claims_are_mutually_exclusive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_run(run("run-1"), now).expect("propose");
    let approved = k
        .transition_run(
            "run-1",
            &[RunStatus::Proposed],
            RunStatus::Approved,
            LeaseGuard::None,
            RunPatch {
                approved_by: Some("bob".into()),
                ..Default::default()
            },
            NewAuditEvent::new(tollgate_topics::AGENT_RUN_APPROVED, "bob"),
            now,
        )
        .expect("approve");
    assert!(matches!(approved, Transition::Done(_)));

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let k = k.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                k.claim_runs(&format!("w{i}"), 1, 60, Utc::now(), None)
                    .expect("claim")
                    .value
                    .len()
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
    assert_eq!(total, 1);
}

#[test]
fn expired_lease_is_reclaimable_and_renewal_requires_holder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_run(run("run-1"), now).expect("propose");
    k.transition_run(
        "run-1",
        &[RunStatus::Proposed],
        RunStatus::Approved,
        LeaseGuard::None,
        RunPatch::default(),
        NewAuditEvent::new(tollgate_topics::AGENT_RUN_APPROVED, "bob"),
        now,
    )
    .expect("approve");

    let got = k.claim_runs("w1", 1, 30, now, None).expect("claim");
    assert_eq!(got.value.len(), 1);
    assert!(got.value[0].is_held_by("w1", now));
    assert!(k.claim_runs("w2", 1, 30, now, None).expect("claim").value.is_empty());
    assert!(!k.renew_run_lease("run-1", "w2", 30, now).expect("renew"));
    assert!(k.renew_run_lease("run-1", "w1", 30, now).expect("renew"));

    let later = now + Duration::seconds(120);
    let stolen = k.claim_runs("w2", 1, 30, later, None).expect("claim");
    assert_eq!(stolen.value.len(), 1);
    assert_eq!(stolen.value[0].claimed_by.as_deref(), Some("w2"));
    assert_eq!(stolen.events[0].payload["previous_holder"], "w1");
}

#[test]
fn adapter_quota_limits_live_claims() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    for id in ["r1", "r2", "r3"] {
        k.propose_run(run(id), now).expect("propose");
        k.transition_run(
            id,
            &[RunStatus::Proposed],
            RunStatus::Approved,
            LeaseGuard::None,
            RunPatch::default(),
            NewAuditEvent::new(tollgate_topics::AGENT_RUN_APPROVED, "bob"),
            now,
        )
        .expect("approve");
    }
    let first = k.claim_runs("w1", 3, 60, now, Some(2)).expect("claim");
    assert_eq!(first.value.len(), 2);
    let second = k.claim_runs("w2", 3, 60, now, Some(2)).expect("claim");
    assert!(second.value.is_empty());
}

#[test]
fn repo_quota_limits_live_changeset_claims() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_changeset(changeset("a", "k-a", Operation::CreateIssue, None, json!({"n": 1})), now)
        .expect("propose");
    k.propose_changeset(changeset("b", "k-b", Operation::CreateIssue, None, json!({"n": 2})), now)
        .expect("propose");
    let mut other = changeset("c", "k-c", Operation::CreateIssue, None, json!({"n": 3}));
    other.repo = "other/repo".into();
    k.propose_changeset(other, now).expect("propose");
    for id in ["a", "b", "c"] {
        approve_cs(&k, id);
    }

    let first = k.claim_changesets("w1", 10, 60, now, Some(1), None).expect("claim");
    let ids: Vec<_> = first.value.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    let second = k.claim_changesets("w2", 10, 60, now, Some(1), None).expect("claim");
    assert!(second.value.is_empty());
}

#[test]
fn expired_applying_changesets_are_reclaimed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_changeset(changeset("cs", "k-cs", Operation::CreateIssue, None, json!({})), now)
        .expect("propose");
    approve_cs(&k, "cs");

    let got = k.claim_changesets("w1", 1, 30, now, None, None).expect("claim");
    assert_eq!(got.value[0].status, ChangesetStatus::Applying);
    assert!(k.claim_changesets("w2", 1, 30, now, None, None).expect("claim").value.is_empty());

    let later = now + Duration::seconds(31);
    assert!(!k.renew_changeset_lease("cs", "w1", 30, later).expect("renew"));
    let taken = k.claim_changesets("w2", 1, 30, later, None, None).expect("claim");
    assert_eq!(taken.value.len(), 1);
    assert_eq!(taken.value[0].status, ChangesetStatus::Applying);
    assert_eq!(taken.value[0].claimed_by.as_deref(), Some("w2"));
    assert!(k.renew_changeset_lease("cs", "w2", 30, later).expect("renew"));
}

#[test]
fn unrepresentable_leases_are_refused_without_claiming() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    k.propose_run(run("run-1"), now).expect("propose");
    k.transition_run(
        "run-1",
        &[RunStatus::Proposed],
        RunStatus::Approved,
        LeaseGuard::None,
        RunPatch::default(),
        NewAuditEvent::new(tollgate_topics::AGENT_RUN_APPROVED, "bob"),
        now,
    )
    .expect("approve");

    for lease in [0, 1 << 63, u64::MAX] {
        assert!(k.claim_runs("w1", 1, lease, now, None).is_err(), "{lease}");
    }
    let row = k.get_run("run-1").expect("get").expect("row");
    assert!(row.claimed_by.is_none());
    assert_eq!(k.claim_runs("w2", 1, 60, now, None).expect("claim").value.len(), 1);
    assert!(k.claim_runs("w1", 1, 60, now, None).expect("claim").value.is_empty());
    assert!(k.renew_run_lease("run-1", "w2", u64::MAX, now).is_err());
}

#[test]
fn audit_query_filters_pages_and_redacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let k = Kernel::open(dir.path()).expect("open");
    let now = Utc::now();
    for i in 0..5 {
        k.append_audit(
            NewAuditEvent::new(tollgate_topics::CHANGESET_DENIED, "mallory")
                .repo(Some("org/secret".into()))
                .reason(ReasonCode::RepoNotAllowlisted)
                .with(json!({"n": i, "token": "ghp_abc"})),
            now + Duration::milliseconds(i),
        )
        .expect("append");
    }
    k.append_audit(NewAuditEvent::new(tollgate_topics::INTERNAL_ERROR, "system"), now)
        .expect("append");

    let page = k
        .query_audit(&AuditQuery {
            actor: Some("mallory".into()),
            limit: 2,
            offset: 2,
            ..Default::default()
        })
        .expect("query");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].payload["n"], 2);
    assert_eq!(page[1].payload["n"], 3);
    assert!(page[0].id < page[1].id);
    assert_eq!(page[0].payload["token"], "[REDACTED]");
    assert_eq!(page[0].reason_code.as_deref(), Some("repo_not_allowlisted"));

    let windowed = k
        .query_audit(&AuditQuery {
            event_type: Some("changeset_denied".into()),
            start: Some(now + Duration::milliseconds(1)),
            end: Some(now + Duration::milliseconds(3)),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(windowed.len(), 2);
}
