//! The authoritative owner of every job record.
//!
//! [`JobController`] is the only component that writes to the [`JobStore`].
//! Each operation runs under a per-job async lock, so the load → transition →
//! persist → enqueue sequence for one job never interleaves with another
//! operation on the same job, while different jobs proceed in parallel.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{PipelineError, QueueError};
use crate::queue::WorkQueue;
use crate::state_machine::{
    CompleteOutcome, DispatchMessage, InitOutcome, JobArtifacts, JobConfig, JobState, JobStatus,
    StateMachine, Step,
};
use crate::store::JobStore;

pub struct JobController {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl JobController {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            queue,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, job_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(job_id.to_string()).or_default().clone()
    }

    /// Start (or restart) a job at the first step.
    ///
    /// A job that is already running is left untouched and reported as
    /// [`InitOutcome::AlreadyRunning`]. Otherwise the new state is persisted
    /// before the first dispatch message is enqueued, so a crash in between
    /// leaves a record that still says "about to run the first step".
    pub async fn init(
        &self,
        job_id: &str,
        config: Option<JobConfig>,
    ) -> Result<InitOutcome, PipelineError> {
        if job_id.trim().is_empty() {
            return Err(PipelineError::InvalidJobId);
        }

        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let existing = self.store.get(job_id).await?;
        let is_new = existing.is_none();
        let mut job = existing.unwrap_or_else(|| JobState::new(job_id));

        if job.status == JobStatus::Running {
            tracing::info!(job_id, current_step = ?job.current_step, "Init rejected: job already running");
            return Ok(InitOutcome::AlreadyRunning(job));
        }

        let config = config.unwrap_or_default();
        config.validate()?;

        if !self.queue.accepting() {
            tracing::warn!(job_id, "Init rejected: work queue backlog is full");
            return Err(QueueError::Full.into());
        }

        let started = StateMachine::start(&mut job, config, is_new, Utc::now());
        debug_assert!(started);

        self.store.put(&job).await?;
        self.queue
            .send(DispatchMessage::new(job_id, Step::first()))
            .await?;

        tracing::info!(job_id, step = %Step::first(), restart = !is_new, "Job started");
        Ok(InitOutcome::Started(job))
    }

    /// Record the outcome of `step` and move the job forward.
    ///
    /// Reports for a step that already completed, or that do not match the
    /// job's current step, change nothing and enqueue nothing. When the job
    /// advances, the new state is persisted before the next step is enqueued.
    pub async fn complete(
        &self,
        job_id: &str,
        step: Step,
        artifacts: Option<JobArtifacts>,
        error: Option<String>,
    ) -> Result<CompleteOutcome, PipelineError> {
        if job_id.trim().is_empty() {
            return Err(PipelineError::InvalidJobId);
        }

        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let mut job = self
            .store
            .get(job_id)
            .await?
            .unwrap_or_else(|| JobState::new(job_id));

        let outcome = StateMachine::complete(&mut job, step, artifacts, error, Utc::now());

        if outcome.mutates() {
            self.store.put(&job).await?;
        }

        match &outcome {
            CompleteOutcome::Advanced(next) => {
                self.queue.send(DispatchMessage::new(job_id, *next)).await?;
                tracing::info!(job_id, %step, next = %next, "Step completed");
            }
            CompleteOutcome::Finished => {
                tracing::info!(job_id, %step, "Job completed");
            }
            CompleteOutcome::Failed => {
                tracing::warn!(
                    job_id,
                    %step,
                    error = job.error.as_deref().unwrap_or_default(),
                    "Step failed, job is now failed",
                );
            }
            CompleteOutcome::Duplicate => {
                tracing::debug!(job_id, %step, "Duplicate completion ignored");
            }
            CompleteOutcome::Ignored {
                status,
                current_step,
            } => {
                tracing::warn!(
                    job_id,
                    %step,
                    %status,
                    current_step = ?current_step,
                    "Completion does not match job state, ignored",
                );
            }
        }

        Ok(outcome)
    }

    /// Snapshot of the job. A job never initialized reads as a fresh pending
    /// record; nothing is written.
    pub async fn status(&self, job_id: &str) -> Result<JobState, PipelineError> {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        Ok(self
            .store
            .get(job_id)
            .await?
            .unwrap_or_else(|| JobState::new(job_id)))
    }
}
