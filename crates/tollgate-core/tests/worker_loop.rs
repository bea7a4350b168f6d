mod common;

use std::time::Duration;

use common::{changeset, harness, human, run_spec};
use serde_json::json;
use tollgate_core::{Tick, Worker};
use tollgate_protocol::{ChangesetStatus, RunStatus};

#[tokio::test]
async fn one_tick_drains_approved_work() {
    let h = harness();
    let cs = h
        .engine
        .propose_changeset(changeset("create_issue", json!({"title": "x"})), &human("alice"))
        .await
        .expect("propose changeset")
        .entity
        .id;
    h.engine.approve_changeset(&cs, &human("bob")).await.expect("approve");
    let run_a = h.approved_run(run_spec("first")).await;
    let run_b = h.approved_run(run_spec("second")).await;
    let untouched = h
        .engine
        .propose_agent_run(run_spec("not approved"), &human("alice"))
        .await
        .expect("propose")
        .entity
        .run_id;

    let worker = Worker::new(h.engine.clone(), "worker-1").with_batch_size(8);
    let tick = worker.run_once().await.expect("tick");
    assert_eq!(
        tick,
        Tick {
            changesets: 1,
            runs: 2,
            reaped: 0
        }
    );
    assert_eq!(
        h.engine.get_changeset(&cs).await.expect("cs").status,
        ChangesetStatus::Applied
    );
    for id in [&run_a, &run_b] {
        assert_eq!(
            h.engine.get_agent_run(id).await.expect("run").status,
            RunStatus::Completed
        );
    }
    assert_eq!(
        h.engine.get_agent_run(&untouched).await.expect("run").status,
        RunStatus::Proposed,
        "unapproved work is never claimed"
    );

    let idle = worker.run_once().await.expect("idle tick");
    assert!(idle.is_idle());
}

#[tokio::test]
async fn run_stops_when_shutdown_resolves() {
    let h = harness();
    let worker = Worker::new(h.engine.clone(), "worker-1").with_idle(Duration::from_millis(5));
    tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(tokio::time::sleep(Duration::from_millis(50))),
    )
    .await
    .expect("worker honours shutdown")
    .expect("clean exit");
}

#[tokio::test]
async fn running_worker_picks_up_new_approvals() {
    let h = harness();
    let worker = Worker::new(h.engine.clone(), "worker-1").with_idle(Duration::from_millis(5));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        worker
            .run(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let run_id = h.approved_run(run_spec("late arrival")).await;
    let mut status = RunStatus::Approved;
    for _ in 0..500 {
        status = h.engine.get_agent_run(&run_id).await.expect("run").status;
        if status == RunStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, RunStatus::Completed);

    stop_tx.send(()).expect("worker alive");
    handle.await.expect("join").expect("clean exit");
}
