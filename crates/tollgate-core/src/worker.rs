use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::{EngineResult, Orchestrator};

/// Work done by one loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tick {
    pub changesets: usize,
    pub runs: usize,
    pub reaped: usize,
}

impl Tick {
    pub fn is_idle(&self) -> bool {
        self.changesets == 0 && self.runs == 0 && self.reaped == 0
    }
}

/// Claims approved work under a stable identity and drives it to completion.
///
/// Several workers (in this process or others) may share one state
/// directory; the store's claim transaction keeps them from picking up the
/// same entity.
#[derive(Debug, Clone)]
pub struct Worker {
    engine: Orchestrator,
    worker_id: String,
    batch_size: u32,
    lease_seconds: u64,
    idle: Duration,
}

impl Worker {
    pub fn new(engine: Orchestrator, worker_id: impl Into<String>) -> Self {
        let cfg = engine.config();
        let batch_size = cfg.worker.batch_size.max(1);
        let lease_seconds = cfg.leases.default_lease_seconds;
        let idle = Duration::from_millis(cfg.worker.poll_interval_ms.max(1));
        Self {
            engine,
            worker_id: worker_id.into(),
            batch_size,
            lease_seconds,
            idle,
        }
    }

    pub fn with_batch_size(mut self, n: u32) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_lease_seconds(mut self, secs: u64) -> Self {
        self.lease_seconds = secs;
        self
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    /// Reap lapsed run leases, then claim and drive one batch of each kind.
    ///
    /// Changesets are applied one at a time in claim order. Agent runs in the
    /// batch execute concurrently. Per-item failures are logged and audited by
    /// the engine; only store faults during reaping or claiming abort the tick.
    pub async fn run_once(&self) -> EngineResult<Tick> {
        let mut tick = Tick {
            reaped: self.engine.reap_expired_leases().await?.len(),
            ..Tick::default()
        };

        let changesets = self
            .engine
            .claim_changesets(&self.worker_id, self.batch_size, self.lease_seconds)
            .await?;
        for cs in changesets {
            match self.engine.apply_changeset(&cs.id, &self.worker_id).await {
                Ok(row) => {
                    tracing::debug!(
                        target: "worker",
                        worker_id = %self.worker_id,
                        changeset_id = %row.id,
                        status = row.status.as_str(),
                        "changeset attempt finished"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "worker",
                        worker_id = %self.worker_id,
                        changeset_id = %cs.id,
                        error = %err,
                        "changeset attempt errored"
                    );
                }
            }
            tick.changesets += 1;
        }

        let runs = self
            .engine
            .claim_agent_runs(&self.worker_id, self.batch_size, self.lease_seconds)
            .await?;
        let mut set = JoinSet::new();
        for run in runs {
            let engine = self.engine.clone();
            let worker_id = self.worker_id.clone();
            set.spawn(async move {
                let out = engine.execute_agent_run(&run.run_id, &worker_id).await;
                (run.run_id, out)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((run_id, Ok(row))) => {
                    tracing::debug!(
                        target: "worker",
                        worker_id = %self.worker_id,
                        run_id = %run_id,
                        status = row.status.as_str(),
                        "run attempt finished"
                    );
                }
                Ok((run_id, Err(err))) => {
                    tracing::warn!(
                        target: "worker",
                        worker_id = %self.worker_id,
                        run_id = %run_id,
                        error = %err,
                        "run attempt errored"
                    );
                }
                Err(join_err) => {
                    tracing::error!(target: "worker", error = %join_err, "run task panicked");
                }
            }
            tick.runs += 1;
        }
        Ok(tick)
    }

    /// Loop until `shutdown` resolves. Shutdown is observed between ticks and
    /// during idle sleeps, so an in-flight attempt always reaches a recorded
    /// state before the loop exits.
    pub async fn run<F>(&self, shutdown: F) -> EngineResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(target: "worker", worker_id = %self.worker_id, "worker started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }
            let tick = match self.run_once().await {
                Ok(t) => t,
                Err(err) => {
                    tracing::error!(target: "worker", worker_id = %self.worker_id, error = %err, "tick failed");
                    Tick::default()
                }
            };
            if tick.is_idle() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.idle) => {}
                }
            }
        }
        tracing::info!(target: "worker", worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }
}
