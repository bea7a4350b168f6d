use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tollgate_protocol::{Budgets, ReasonCode};
use tollgate_runtime::{
    AdapterError, ExecutorAdapter, Job, JobState, PollReport, SharedAdapter, Usage, WorkItem,
};

use crate::Orchestrator;

/// Ceilings enforced while a job is in flight.
#[derive(Debug, Clone, Default)]
pub(crate) struct Limits {
    pub wall: Option<Duration>,
    pub budgets: Option<Budgets>,
    pub tools_allowed: Option<Vec<String>>,
}

impl Limits {
    fn check(&self, report: &PollReport) -> Option<(ReasonCode, String)> {
        if let Some(allowed) = &self.tools_allowed {
            if let Some(tool) = report
                .requested_tools
                .iter()
                .find(|t| !allowed.iter().any(|a| a == *t))
            {
                return Some((
                    ReasonCode::ToolNotAllowed,
                    format!("tool {tool:?} is not in tools_allowed"),
                ));
            }
        }
        if let Some(b) = &self.budgets {
            let Usage {
                total_tokens,
                tool_calls,
            } = report.usage;
            if total_tokens > b.max_total_tokens {
                return Some((
                    ReasonCode::BudgetExceeded,
                    format!("used {total_tokens} tokens of {}", b.max_total_tokens),
                ));
            }
            if tool_calls > b.max_tool_calls {
                return Some((
                    ReasonCode::BudgetExceeded,
                    format!("made {tool_calls} tool calls of {}", b.max_tool_calls),
                ));
            }
        }
        None
    }
}

/// Lease the driving worker must keep alive between polls.
#[derive(Debug, Clone)]
pub(crate) enum LeaseRef {
    Changeset { id: String, worker_id: String },
    Run { id: String, worker_id: String },
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Succeeded {
        job_id: String,
        binding: Option<String>,
        artifacts: Vec<String>,
        usage: Usage,
    },
    Failed {
        job_id: Option<String>,
        reason: ReasonCode,
        message: String,
        retry_after: Option<Duration>,
    },
    /// A ceiling was hit; the job was cancelled.
    Exceeded {
        job_id: Option<String>,
        reason: ReasonCode,
        message: String,
    },
    /// Interrupted by a cancel request.
    Cancelled,
    /// Heartbeat failed; another worker may own the entity now. The
    /// abandoned job is named in the refusal audit.
    LeaseLost { job_id: String },
}

impl Outcome {
    fn failed(job_id: Option<String>, err: AdapterError) -> Self {
        Outcome::Failed {
            job_id,
            reason: err.reason_code(),
            message: err.to_string(),
            retry_after: err.retry_after(),
        }
    }
}

enum Step<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Await `fut` unless the deadline passes or a cancel arrives first.
async fn step<F: Future>(fut: F, deadline: Option<Instant>, cancel: &Notify) -> Step<F::Output> {
    let expiry = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.notified() => Step::Cancelled,
        _ = expiry => Step::TimedOut,
        out = fut => Step::Done(out),
    }
}

impl Orchestrator {
    /// Submit `item` and poll it to a finished state, renewing `lease`
    /// between polls. Suspension points are exactly the adapter calls and
    /// the poll interval.
    pub(crate) async fn drive(
        &self,
        adapter: SharedAdapter,
        item: WorkItem,
        limits: Limits,
        lease: LeaseRef,
        cancel: Arc<Notify>,
    ) -> Outcome {
        let deadline = limits.wall.map(|w| Instant::now() + w);
        let poll_every = self.config().adapters.poll_interval();
        let submission = match step(adapter.submit(&item), deadline, &cancel).await {
            Step::Done(Ok(s)) => s,
            Step::Done(Err(err)) => return Outcome::failed(None, err),
            Step::TimedOut => return wall_time(None, &limits),
            Step::Cancelled => return Outcome::Cancelled,
        };
        let job = Job {
            job_id: submission.job_id,
            item,
        };
        tracing::debug!(
            target: "adapters",
            adapter = adapter.name(),
            job_id = %job.job_id,
            state = submission.state.as_str(),
            "submitted"
        );
        let mut report = PollReport::state(submission.state);
        loop {
            if let Some((reason, message)) = limits.check(&report) {
                abandon(adapter.as_ref(), &job).await;
                return Outcome::Exceeded {
                    job_id: Some(job.job_id),
                    reason,
                    message,
                };
            }
            match report.state {
                JobState::Succeeded => {
                    let artifacts = match step(adapter.fetch_artifacts(&job), deadline, &cancel).await {
                        Step::Done(Ok(paths)) => paths,
                        Step::Done(Err(err)) => return Outcome::failed(Some(job.job_id), err),
                        Step::TimedOut => return wall_time(Some(job.job_id), &limits),
                        Step::Cancelled => return Outcome::Cancelled,
                    };
                    return Outcome::Succeeded {
                        job_id: job.job_id,
                        binding: report.binding,
                        artifacts,
                        usage: report.usage,
                    };
                }
                JobState::Failed => {
                    return Outcome::Failed {
                        job_id: Some(job.job_id),
                        reason: report.reason_code.unwrap_or(ReasonCode::AdapterRejected),
                        message: report.message.unwrap_or_else(|| "job failed".into()),
                        retry_after: None,
                    }
                }
                JobState::Cancelled => {
                    return Outcome::Failed {
                        job_id: Some(job.job_id),
                        reason: ReasonCode::AdapterRejected,
                        message: "executor cancelled the job".into(),
                        retry_after: None,
                    }
                }
                JobState::Queued | JobState::Running => {}
            }

            match step(tokio::time::sleep(poll_every), deadline, &cancel).await {
                Step::Done(()) => {}
                Step::TimedOut => {
                    abandon(adapter.as_ref(), &job).await;
                    return wall_time(Some(job.job_id), &limits);
                }
                Step::Cancelled => {
                    abandon(adapter.as_ref(), &job).await;
                    return Outcome::Cancelled;
                }
            }
            if !self.heartbeat(&lease).await {
                abandon(adapter.as_ref(), &job).await;
                return Outcome::LeaseLost { job_id: job.job_id };
            }
            report = match step(adapter.poll(&job), deadline, &cancel).await {
                Step::Done(Ok(r)) => r,
                Step::Done(Err(err)) => return Outcome::failed(Some(job.job_id), err),
                Step::TimedOut => {
                    abandon(adapter.as_ref(), &job).await;
                    return wall_time(Some(job.job_id), &limits);
                }
                Step::Cancelled => {
                    abandon(adapter.as_ref(), &job).await;
                    return Outcome::Cancelled;
                }
            };
        }
    }

    /// Extend the lease by the default lease length. Store errors count as a
    /// lost lease.
    async fn heartbeat(&self, lease: &LeaseRef) -> bool {
        let now = self.now();
        let secs = self.config().leases.default_lease_seconds;
        let lease = lease.clone();
        let renewed = self
            .kernel()
            .call(move |k| match &lease {
                LeaseRef::Changeset { id, worker_id } => {
                    k.renew_changeset_lease(id, worker_id, secs, now)
                }
                LeaseRef::Run { id, worker_id } => k.renew_run_lease(id, worker_id, secs, now),
            })
            .await;
        match renewed {
            Ok(held) => {
                if !held {
                    tracing::warn!(target: "leases", "lease lost while job in flight");
                }
                held
            }
            Err(err) => {
                tracing::error!(target: "leases", error = %err, "lease renewal failed");
                false
            }
        }
    }
}

fn wall_time(job_id: Option<String>, limits: &Limits) -> Outcome {
    let secs = limits.wall.map(|w| w.as_secs()).unwrap_or_default();
    Outcome::Exceeded {
        job_id,
        reason: ReasonCode::WallTimeExceeded,
        message: format!("exceeded max_wall_seconds ({secs}s)"),
    }
}

/// Best-effort cancel of a job we are giving up on.
async fn abandon(adapter: &dyn ExecutorAdapter, job: &Job) {
    if let Err(err) = adapter.cancel(job).await {
        tracing::warn!(
            target: "adapters",
            adapter = adapter.name(),
            job_id = %job.job_id,
            error = %err,
            "cancel failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(tools: &[&str], tokens: u64, calls: u32) -> PollReport {
        let mut r = PollReport::state(JobState::Running);
        r.requested_tools = tools.iter().map(|t| t.to_string()).collect();
        r.usage = Usage {
            total_tokens: tokens,
            tool_calls: calls,
        };
        r
    }

    #[test]
    fn limits_fail_closed_on_tools_then_budgets() {
        let limits = Limits {
            wall: None,
            budgets: Some(Budgets {
                max_total_tokens: 100,
                max_tool_calls: 2,
                max_wall_seconds: 10,
            }),
            tools_allowed: Some(vec!["github_read".into()]),
        };
        assert!(limits.check(&report(&["github_read"], 100, 2)).is_none());
        let (code, msg) = limits
            .check(&report(&["github_write"], 0, 0))
            .expect("tool violation");
        assert_eq!(code, ReasonCode::ToolNotAllowed);
        assert!(msg.contains("github_write"));
        let (code, _) = limits.check(&report(&[], 101, 0)).expect("token violation");
        assert_eq!(code, ReasonCode::BudgetExceeded);
        let (code, _) = limits.check(&report(&[], 0, 3)).expect("call violation");
        assert_eq!(code, ReasonCode::BudgetExceeded);
    }

    #[test]
    fn unrestricted_limits_admit_everything() {
        assert!(Limits::default()
            .check(&report(&["anything"], u64::MAX, u32::MAX))
            .is_none());
    }
}
