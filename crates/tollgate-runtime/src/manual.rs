use crate::{
    AdapterError, CancelReport, ExecutorAdapter, Job, JobState, PollReport, Submission, WorkItem,
};

/// Executor for work a human carries out by hand. Submission records the
/// hand-off and completes at once; there is nothing to poll or cancel.
pub struct ManualAdapter;

#[async_trait::async_trait]
impl ExecutorAdapter for ManualAdapter {
    fn name(&self) -> &str {
        "manual"
    }

    async fn submit(&self, item: &WorkItem) -> Result<Submission, AdapterError> {
        tracing::info!(
            target: "adapters",
            entity = item.entity_id(),
            "manual executor: recorded hand-off"
        );
        Ok(Submission {
            job_id: format!("manual:{}#{}", item.entity_id(), item.attempt()),
            state: JobState::Succeeded,
        })
    }

    async fn poll(&self, _job: &Job) -> Result<PollReport, AdapterError> {
        Ok(PollReport::state(JobState::Succeeded))
    }

    async fn fetch_artifacts(&self, _job: &Job) -> Result<Vec<String>, AdapterError> {
        Ok(Vec::new())
    }

    async fn cancel(&self, _job: &Job) -> Result<CancelReport, AdapterError> {
        Ok(CancelReport {
            state: JobState::Succeeded,
            reason_code: None,
        })
    }
}
