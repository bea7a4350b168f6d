use anyhow::Result;
use clap::Args;
use std::time::Duration;
use tollgate_core::Worker;

use super::util::{open_engine, print_json, GlobalArgs};

#[derive(Args)]
pub struct WorkerArgs {
    /// Stable worker identity; defaults to `worker-<pid>`
    #[arg(long)]
    id: Option<String>,
    /// Run a single iteration and print what it did
    #[arg(long)]
    once: bool,
    /// Items claimed per kind per iteration
    #[arg(long)]
    batch_size: Option<u32>,
    /// Lease length in seconds
    #[arg(long)]
    lease_seconds: Option<u64>,
    /// Idle sleep between empty iterations, in milliseconds
    #[arg(long)]
    idle_ms: Option<u64>,
}

pub async fn execute(global: &GlobalArgs, args: WorkerArgs) -> Result<()> {
    let engine = open_engine(global)?;
    let id = args
        .id
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));
    let mut worker = Worker::new(engine, id);
    if let Some(n) = args.batch_size {
        worker = worker.with_batch_size(n);
    }
    if let Some(secs) = args.lease_seconds {
        worker = worker.with_lease_seconds(secs);
    }
    if let Some(ms) = args.idle_ms {
        worker = worker.with_idle(Duration::from_millis(ms));
    }

    if args.once {
        let tick = worker.run_once().await?;
        return print_json(
            &serde_json::json!({
                "worker_id": worker.id(),
                "changesets": tick.changesets,
                "runs": tick.runs,
                "reaped": tick.reaped,
            }),
            global.pretty,
        );
    }

    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(target: "worker", error = %e, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub async fn reap(global: &GlobalArgs) -> Result<()> {
    let engine = open_engine(global)?;
    let rows = engine.reap_expired_leases().await?;
    print_json(&rows, global.pretty)
}
