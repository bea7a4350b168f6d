use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{
    AdapterError, CancelReport, ExecutorAdapter, Job, JobState, PollReport, Submission, Usage,
    WorkItem,
};

#[derive(Default)]
struct StubJob {
    polls: u32,
    cancelled: bool,
}

/// Asynchronous provider stand-in: jobs queue on submit, report `running`
/// on the first poll and succeed on the next. Job ids derive from the
/// idempotency key so a resubmitted attempt maps to a distinct job.
#[derive(Default)]
pub struct ProviderStubAdapter {
    jobs: Mutex<HashMap<String, StubJob>>,
}

impl ProviderStubAdapter {
    fn usage_for(item: &WorkItem) -> Usage {
        match item {
            WorkItem::AgentRun(run) => Usage {
                total_tokens: (run.goal.len() as u64 * 4).min(run.budgets.max_total_tokens),
                tool_calls: 0,
            },
            WorkItem::Changeset(_) => Usage::default(),
        }
    }
}

#[async_trait::async_trait]
impl ExecutorAdapter for ProviderStubAdapter {
    fn name(&self) -> &str {
        "provider_stub"
    }

    async fn submit(&self, item: &WorkItem) -> Result<Submission, AdapterError> {
        let job_id = format!("provider_stub:{}#{}", item.idempotency_key(), item.attempt());
        self.jobs
            .lock()
            .await
            .entry(job_id.clone())
            .or_default();
        Ok(Submission {
            job_id,
            state: JobState::Queued,
        })
    }

    async fn poll(&self, job: &Job) -> Result<PollReport, AdapterError> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(&job.job_id) else {
            return Err(AdapterError::Validation(format!("unknown job {}", job.job_id)));
        };
        if entry.cancelled {
            return Ok(PollReport::state(JobState::Cancelled));
        }
        entry.polls += 1;
        let state = if entry.polls >= 2 {
            JobState::Succeeded
        } else {
            JobState::Running
        };
        let mut report = PollReport::state(state);
        report.usage = Self::usage_for(&job.item);
        if let (JobState::Succeeded, WorkItem::Changeset(cs)) = (state, &job.item) {
            report.binding = Some(format!("{}#stub-{}", cs.repo, cs.changeset_id));
        }
        Ok(report)
    }

    async fn fetch_artifacts(&self, job: &Job) -> Result<Vec<String>, AdapterError> {
        Ok(match &job.item {
            WorkItem::AgentRun(run) => vec![
                format!("artifacts/{}/summary.md", run.run_id),
                format!("artifacts/{}/transcript.json", run.run_id),
            ],
            WorkItem::Changeset(_) => Vec::new(),
        })
    }

    async fn cancel(&self, job: &Job) -> Result<CancelReport, AdapterError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs.entry(job.job_id.clone()).or_default();
        entry.cancelled = true;
        Ok(CancelReport {
            state: JobState::Cancelled,
            reason_code: Some(tollgate_protocol::ReasonCode::Cancelled),
        })
    }
}
