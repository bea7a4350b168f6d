//! In-memory executor whose behaviour is scripted up front.
//!
//! Submits and polls consume their script in order; once a script runs dry
//! the adapter succeeds. Effects are recorded per idempotency key so callers
//! can assert that an intent was applied at most once.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tollgate_runtime::{
    AdapterError, CancelReport, ExecutorAdapter, Job, JobState, PollReport, Submission, Usage,
    WorkItem,
};

#[derive(Clone, Debug)]
pub enum PollStep {
    /// Report `running` with usage and pending tool requests.
    Running {
        usage: Usage,
        requested_tools: Vec<String>,
    },
    /// Sleep, then report `running`. Used to hold a job in flight.
    Stall(Duration),
    Fail(AdapterError),
    /// Finish with a terminal state other than success.
    Finish(PollReport),
}

#[derive(Default)]
struct State {
    submits: VecDeque<AdapterError>,
    polls: VecDeque<PollStep>,
    submit_calls: u32,
    poll_calls: u32,
    effects: HashMap<String, u32>,
    cancelled: Vec<String>,
    artifacts: Vec<String>,
}

pub struct ScriptedAdapter {
    name: String,
    /// Complete on submit rather than via polling.
    synchronous: bool,
    state: Mutex<State>,
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            synchronous: false,
            state: Mutex::new(State::default()),
        }
    }

    /// An adapter that finishes work inside `submit`, like a direct API call.
    pub fn synchronous(name: impl Into<String>) -> Self {
        Self {
            synchronous: true,
            ..Self::new(name)
        }
    }

    /// Fail the next `n` submits with `err`.
    pub async fn fail_submits(&self, n: usize, err: AdapterError) {
        let mut st = self.state.lock().await;
        for _ in 0..n {
            st.submits.push_back(err.clone());
        }
    }

    pub async fn push_poll(&self, step: PollStep) {
        self.state.lock().await.polls.push_back(step);
    }

    pub async fn set_artifacts(&self, paths: Vec<String>) {
        self.state.lock().await.artifacts = paths;
    }

    pub async fn submit_calls(&self) -> u32 {
        self.state.lock().await.submit_calls
    }

    pub async fn poll_calls(&self) -> u32 {
        self.state.lock().await.poll_calls
    }

    /// How many times the intent behind `idempotency_key` took effect.
    pub async fn effects(&self, idempotency_key: &str) -> u32 {
        self.state
            .lock()
            .await
            .effects
            .get(idempotency_key)
            .copied()
            .unwrap_or(0)
    }

    pub async fn cancelled_jobs(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    fn succeeded(st: &mut State, item: &WorkItem) -> PollReport {
        *st.effects.entry(item.idempotency_key().to_string()).or_insert(0) += 1;
        let mut report = PollReport::state(JobState::Succeeded);
        if let WorkItem::Changeset(cs) = item {
            report.binding = Some(format!("{}#{}", cs.repo, cs.changeset_id));
        }
        report
    }
}

#[async_trait::async_trait]
impl ExecutorAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, item: &WorkItem) -> Result<Submission, AdapterError> {
        let mut st = self.state.lock().await;
        st.submit_calls += 1;
        if let Some(err) = st.submits.pop_front() {
            return Err(err);
        }
        let job_id = format!("{}:{}#{}", self.name, item.entity_id(), item.attempt());
        let state = if self.synchronous {
            Self::succeeded(&mut st, item);
            JobState::Succeeded
        } else {
            JobState::Queued
        };
        Ok(Submission { job_id, state })
    }

    async fn poll(&self, job: &Job) -> Result<PollReport, AdapterError> {
        let step = {
            let mut st = self.state.lock().await;
            st.poll_calls += 1;
            if st.cancelled.contains(&job.job_id) {
                return Ok(PollReport::state(JobState::Cancelled));
            }
            match st.polls.pop_front() {
                Some(step) => step,
                None => return Ok(Self::succeeded(&mut st, &job.item)),
            }
        };
        match step {
            PollStep::Running {
                usage,
                requested_tools,
            } => {
                let mut report = PollReport::state(JobState::Running);
                report.usage = usage;
                report.requested_tools = requested_tools;
                Ok(report)
            }
            PollStep::Stall(d) => {
                tokio::time::sleep(d).await;
                Ok(PollReport::state(JobState::Running))
            }
            PollStep::Fail(err) => Err(err),
            PollStep::Finish(report) => Ok(report),
        }
    }

    async fn fetch_artifacts(&self, _job: &Job) -> Result<Vec<String>, AdapterError> {
        Ok(self.state.lock().await.artifacts.clone())
    }

    async fn cancel(&self, job: &Job) -> Result<CancelReport, AdapterError> {
        self.state.lock().await.cancelled.push(job.job_id.clone());
        Ok(CancelReport {
            state: JobState::Cancelled,
            reason_code: Some(tollgate_protocol::ReasonCode::Cancelled),
        })
    }
}
