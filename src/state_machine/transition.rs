use chrono::{DateTime, Utc};

use super::job::{JobArtifacts, JobConfig, JobState, JobStatus, StepStatus, all_pending};
use super::step::Step;

/// Result of an `init` request.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    /// The job is now running at the first step.
    Started(JobState),
    /// The job was already running; nothing changed.
    AlreadyRunning(JobState),
}

impl InitOutcome {
    pub fn state(&self) -> &JobState {
        match self {
            InitOutcome::Started(state) | InitOutcome::AlreadyRunning(state) => state,
        }
    }
}

/// Result of reporting a step outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    /// The step completed and the job moved on to the given step.
    Advanced(Step),
    /// The last step completed; the job is done.
    Finished,
    /// The step failed; the job is terminally failed.
    Failed,
    /// The step had already completed. Nothing changed.
    Duplicate,
    /// The report does not apply to the job as it stands (not running, or not
    /// the current step). Nothing changed.
    Ignored {
        status: JobStatus,
        current_step: Option<Step>,
    },
}

impl CompleteOutcome {
    /// Whether the job record was modified and must be persisted.
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            CompleteOutcome::Advanced(_) | CompleteOutcome::Finished | CompleteOutcome::Failed
        )
    }

    /// Label used on the controller surface.
    pub fn label(&self) -> &'static str {
        match self {
            CompleteOutcome::Advanced(_) | CompleteOutcome::Finished => "updated",
            CompleteOutcome::Duplicate => "duplicate",
            CompleteOutcome::Failed => "failed",
            CompleteOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Pure transition rules for a single job record.
///
/// No I/O happens here; the controller persists and enqueues based on what
/// these functions return.
pub struct StateMachine;

impl StateMachine {
    /// Move a job into `Running` at the first step.
    ///
    /// Returns `false` and leaves `job` untouched if it is already running.
    /// A terminal job starts a fresh run: step statuses, artifacts and error
    /// are reset, `created_at` is kept.
    pub fn start(job: &mut JobState, config: JobConfig, is_new: bool, now: DateTime<Utc>) -> bool {
        if job.status == JobStatus::Running {
            return false;
        }

        job.status = JobStatus::Running;
        job.current_step = Some(Step::first());
        job.config = config;
        job.artifacts = JobArtifacts::default();
        job.step_status = all_pending();
        job.error = None;
        if is_new {
            job.created_at = now;
        }
        job.updated_at = now;
        true
    }

    /// Apply a step report to `job`.
    ///
    /// - Already-completed step: `Duplicate`, no change.
    /// - Job not running or `step` is not the current step: `Ignored`.
    /// - `error` present: step and job become `Failed`, partial artifacts kept.
    /// - Otherwise the step completes and the job advances or finishes.
    pub fn complete(
        job: &mut JobState,
        step: Step,
        artifacts: Option<JobArtifacts>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> CompleteOutcome {
        if job.step_status(step) == StepStatus::Completed {
            return CompleteOutcome::Duplicate;
        }
        if job.status != JobStatus::Running || job.current_step != Some(step) {
            return CompleteOutcome::Ignored {
                status: job.status,
                current_step: job.current_step,
            };
        }

        if let Some(artifacts) = artifacts {
            job.artifacts.merge(artifacts);
        }
        job.updated_at = now;

        if let Some(message) = error {
            job.step_status.insert(step, StepStatus::Failed);
            job.status = JobStatus::Failed;
            job.current_step = None;
            job.error = Some(message);
            return CompleteOutcome::Failed;
        }

        job.step_status.insert(step, StepStatus::Completed);
        match step.next() {
            Some(next) => {
                job.current_step = Some(next);
                job.status = JobStatus::Running;
                CompleteOutcome::Advanced(next)
            }
            None => {
                job.current_step = None;
                job.status = JobStatus::Completed;
                CompleteOutcome::Finished
            }
        }
    }
}
