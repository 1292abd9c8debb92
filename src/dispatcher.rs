//! Work-queue consumer.
//!
//! For every delivered message the [`StepDispatcher`] checks the job's
//! current state, runs the step through the [`StepExecutor`] and reports the
//! result to the [`JobController`]. Redelivered copies of a message whose
//! step already completed are skipped, which is what keeps the pipeline
//! correct on an at-least-once queue.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::controller::JobController;
use crate::error::PipelineError;
use crate::executor::StepExecutor;
use crate::queue::{Delivery, QueueReceiver, WorkQueue};
use crate::state_machine::{
    CompleteOutcome, DispatchMessage, JobArtifacts, JobState, JobStatus, Step, StepStatus,
};

/// What happened to one delivered message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Malformed message; dropped without retry.
    Dropped,
    /// The job is not running or has moved past/before this step.
    Stale,
    /// The step already completed; this was a redelivery.
    Duplicate,
    /// The step ran and its outcome was reported.
    Reported(CompleteOutcome),
}

/// Result of running one step and reporting it.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRun {
    pub outcome: CompleteOutcome,
    /// The step's failure message, if it failed.
    pub error: Option<String>,
}

/// Loosely-typed view of a queue body so each missing field can be named.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    job_id: Option<String>,
    step: Option<String>,
    attempt: Option<u32>,
}

/// Decode and validate a queue body. Logs and returns `None` if unusable.
fn decode(body: &str) -> Option<DispatchMessage> {
    let raw: RawMessage = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, body, "Dropping undecodable queue message");
            return None;
        }
    };

    let Some(job_id) = raw.job_id.filter(|id| !id.trim().is_empty()) else {
        tracing::warn!(body, "Dropping queue message without jobId");
        return None;
    };
    let Some(step) = raw.step else {
        tracing::warn!(job_id, "Dropping queue message without step");
        return None;
    };
    let step = match step.parse::<Step>() {
        Ok(step) => step,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Dropping queue message");
            return None;
        }
    };

    Some(DispatchMessage {
        job_id,
        step,
        attempt: raw.attempt,
    })
}

pub struct StepDispatcher {
    controller: Arc<JobController>,
    executor: Arc<dyn StepExecutor>,
    queue: Arc<dyn WorkQueue>,
    max_delivery_attempts: u32,
}

impl StepDispatcher {
    pub fn new(
        controller: Arc<JobController>,
        executor: Arc<dyn StepExecutor>,
        queue: Arc<dyn WorkQueue>,
        max_delivery_attempts: u32,
    ) -> Self {
        Self {
            controller,
            executor,
            queue,
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    /// Process one delivery.
    ///
    /// `Err` means an infrastructure fault (store or queue) prevented the
    /// outcome from being recorded; the caller decides whether to redeliver.
    pub async fn handle(&self, delivery: &Delivery) -> Result<DispatchOutcome, PipelineError> {
        let Some(message) = decode(&delivery.body) else {
            return Ok(DispatchOutcome::Dropped);
        };
        self.dispatch(&message).await
    }

    async fn dispatch(&self, message: &DispatchMessage) -> Result<DispatchOutcome, PipelineError> {
        let job_id = message.job_id.as_str();
        let step = message.step;
        let job = self.controller.status(job_id).await?;

        if job.step_status(step) == StepStatus::Completed {
            tracing::debug!(job_id, %step, "Step already completed, skipping redelivery");
            return Ok(DispatchOutcome::Duplicate);
        }
        if job.status != JobStatus::Running || job.current_step != Some(step) {
            tracing::info!(
                job_id,
                %step,
                status = %job.status,
                current_step = ?job.current_step,
                "Skipping message that no longer matches job state",
            );
            return Ok(DispatchOutcome::Stale);
        }

        let run = self.execute_and_report(&job, step).await?;
        Ok(DispatchOutcome::Reported(run.outcome))
    }

    /// Run `step` for `job_id` immediately and report it, skipping the
    /// duplicate and staleness checks. Used for manual, out-of-band runs.
    pub async fn run_step(&self, job_id: &str, step: Step) -> Result<StepRun, PipelineError> {
        let job = self.controller.status(job_id).await?;
        self.execute_and_report(&job, step).await
    }

    async fn execute_and_report(&self, job: &JobState, step: Step) -> Result<StepRun, PipelineError> {
        tracing::info!(job_id = %job.job_id, %step, "Executing step");

        match self.execute(job, step).await {
            Ok(artifacts) => {
                let outcome = self
                    .controller
                    .complete(&job.job_id, step, Some(artifacts), None)
                    .await?;
                Ok(StepRun { outcome, error: None })
            }
            Err(message) => {
                tracing::warn!(job_id = %job.job_id, %step, error = %message, "Step execution failed");
                let outcome = self
                    .controller
                    .complete(&job.job_id, step, None, Some(message.clone()))
                    .await?;
                Ok(StepRun {
                    outcome,
                    error: Some(message),
                })
            }
        }
    }

    /// Run the executor on its own task so a panic surfaces as a step
    /// failure instead of taking the consumer down with it.
    async fn execute(&self, job: &JobState, step: Step) -> Result<JobArtifacts, String> {
        let executor = Arc::clone(&self.executor);
        let job_id = job.job_id.clone();
        let config = job.config.clone();
        let artifacts = job.artifacts.clone();

        let task = tokio::spawn(async move { executor.execute(&job_id, step, &config, &artifacts).await });

        match task.await {
            Ok(Ok(artifacts)) => Ok(artifacts),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join) => Err(format!("step execution aborted: {join}")),
        }
    }

    /// Consume `receiver` until cancelled or every sender is gone.
    ///
    /// At most `workers` messages are processed concurrently. In-flight
    /// messages are allowed to finish before this returns.
    pub async fn run(self: Arc<Self>, mut receiver: QueueReceiver, workers: usize, cancel: CancellationToken) {
        let workers = workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        tracing::info!(workers, max_delivery_attempts = self.max_delivery_attempts, "Step dispatcher started");

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatcher = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                dispatcher.process(delivery).await;
            });

            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        tracing::info!("Step dispatcher stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let Some(message) = decode(&delivery.body) else {
            return;
        };

        match self.dispatch(&message).await {
            Ok(outcome) => {
                tracing::debug!(job_id = %message.job_id, step = %message.step, ?outcome, "Message handled");
            }
            Err(err) => self.redeliver(message, err).await,
        }
    }

    /// Put work for the job back on the queue after an infrastructure fault,
    /// until the delivery budget is spent.
    ///
    /// The fault may have struck after the step's result was persisted (for
    /// example when enqueueing the next step failed), so the job is re-read
    /// and the redelivery targets its current step rather than the old one.
    async fn redeliver(&self, message: DispatchMessage, err: PipelineError) {
        let attempt = message.attempt.unwrap_or(0) + 1;

        if attempt >= self.max_delivery_attempts {
            tracing::error!(
                job_id = %message.job_id,
                step = %message.step,
                attempt,
                error = %err,
                "Giving up on message; job stays running until an operator intervenes",
            );
            return;
        }

        let step = match self.controller.status(&message.job_id).await {
            Ok(job) if job.status == JobStatus::Running => job.current_step.unwrap_or(message.step),
            Ok(job) => {
                tracing::info!(
                    job_id = %message.job_id,
                    status = %job.status,
                    error = %err,
                    "Job no longer running, nothing to redeliver",
                );
                return;
            }
            Err(status_err) => {
                tracing::warn!(job_id = %message.job_id, error = %status_err, "Could not re-read job before redelivery");
                message.step
            }
        };
        let next = message.redelivery(step);

        tracing::warn!(
            job_id = %message.job_id,
            failed_step = %message.step,
            step = %next.step,
            attempt,
            error = %err,
            "Infrastructure fault, redelivering message",
        );
        if let Err(send_err) = self.queue.send(next).await {
            tracing::error!(job_id = %message.job_id, error = %send_err, "Redelivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::error::{QueueError, StepError};
    use crate::executor::MockStepExecutor;
    use crate::queue::ChannelQueue;
    use crate::state_machine::{InitOutcome, JobConfig, NarrationProvider};
    use crate::store::{JobStore, MemoryJobStore};
    use crate::testing::{self, FlakyStore, RecordingQueue};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Executor that counts calls and succeeds with empty artifacts.
    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for CountingExecutor {
        async fn execute(
            &self,
            _job_id: &str,
            _step: Step,
            _config: &JobConfig,
            _artifacts: &JobArtifacts,
        ) -> Result<JobArtifacts, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(JobArtifacts::default())
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl StepExecutor for PanickingExecutor {
        async fn execute(
            &self,
            _job_id: &str,
            _step: Step,
            _config: &JobConfig,
            _artifacts: &JobArtifacts,
        ) -> Result<JobArtifacts, StepError> {
            panic!("encoder crashed");
        }
    }

    fn delivery(job_id: &str, step: Step) -> Delivery {
        Delivery::new(serde_json::to_string(&DispatchMessage::new(job_id, step)).unwrap())
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let (controller, _store, queue) = testing::controller();
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller, exec.clone(), queue.clone(), 3);

        for body in [
            "not json",
            r#"{"step": "generate-story"}"#,
            r#"{"jobId": "", "step": "generate-story"}"#,
            r#"{"jobId": "job-1"}"#,
            r#"{"jobId": "job-1", "step": "render-trailer"}"#,
        ] {
            let outcome = dispatcher.handle(&Delivery::new(body)).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Dropped, "body {body}");
        }
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runs_current_step_and_reports_success() {
        let (controller, _store, queue) = testing::controller();
        controller.init("job-1", None).await.unwrap();
        queue.clear().await;
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller.clone(), exec.clone(), queue.clone(), 3);

        let outcome = dispatcher
            .handle(&delivery("job-1", Step::GenerateStory))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Reported(CompleteOutcome::Advanced(Step::GenerateImages))
        );
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.sent().await,
            vec![DispatchMessage::new("job-1", Step::GenerateImages)]
        );
    }

    #[tokio::test]
    async fn redelivered_message_is_skipped() {
        let (controller, _store, queue) = testing::controller();
        controller.init("job-1", None).await.unwrap();
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller.clone(), exec.clone(), queue.clone(), 3);

        dispatcher.handle(&delivery("job-1", Step::GenerateStory)).await.unwrap();
        queue.clear().await;

        let outcome = dispatcher
            .handle(&delivery("job-1", Step::GenerateStory))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Duplicate);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(queue.sent().await.is_empty());
    }

    #[tokio::test]
    async fn message_for_unstarted_job_is_stale() {
        let (controller, _store, queue) = testing::controller();
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller, exec.clone(), queue, 3);

        let outcome = dispatcher
            .handle(&delivery("never-started", Step::GenerateStory))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Stale);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn step_failure_fails_job() {
        let (controller, _store, queue) = testing::controller();
        let mut config = JobConfig::default();
        config.narration.provider = NarrationProvider::Elevenlabs;
        controller.init("job-1", Some(config)).await.unwrap();
        let exec = Arc::new(MockStepExecutor::new(Arc::new(MemoryArtifactStore::new())));
        let dispatcher = StepDispatcher::new(controller.clone(), exec, queue.clone(), 3);

        for step in [Step::GenerateStory, Step::GenerateImages, Step::GenerateNarration] {
            dispatcher.handle(&delivery("job-1", step)).await.unwrap();
        }

        let state = controller.status("job-1").await.unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.step_status(Step::GenerateNarration), StepStatus::Failed);
        assert_eq!(
            state.error.as_deref(),
            Some("generate-narration: provider 'elevenlabs' is not available")
        );
        assert!(state.artifacts.images.is_some());
    }

    #[tokio::test]
    async fn panic_in_executor_is_reported_as_failure() {
        let (controller, _store, queue) = testing::controller();
        controller.init("job-1", None).await.unwrap();
        let dispatcher = StepDispatcher::new(controller.clone(), Arc::new(PanickingExecutor), queue, 3);

        let outcome = dispatcher
            .handle(&delivery("job-1", Step::GenerateStory))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Reported(CompleteOutcome::Failed));
        let state = controller.status("job-1").await.unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert!(state.error.unwrap().starts_with("step execution aborted"));
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_error() {
        let store = Arc::new(FlakyStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let controller = Arc::new(JobController::new(store.clone(), queue.clone()));
        controller.init("job-1", None).await.unwrap();
        let dispatcher = StepDispatcher::new(
            controller.clone(),
            Arc::new(CountingExecutor::default()),
            queue,
            3,
        );

        store.fail_writes(true);
        let err = dispatcher
            .handle(&delivery("job-1", Step::GenerateStory))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }

    #[tokio::test]
    async fn redelivery_respects_attempt_budget() {
        let store = Arc::new(FlakyStore::default());
        let queue = Arc::new(RecordingQueue::default());
        let controller = Arc::new(JobController::new(store.clone(), queue.clone()));
        controller.init("job-1", None).await.unwrap();
        queue.clear().await;
        let dispatcher = StepDispatcher::new(
            controller,
            Arc::new(CountingExecutor::default()),
            queue.clone(),
            2,
        );
        store.fail_writes(true);

        dispatcher.process(delivery("job-1", Step::GenerateStory)).await;
        let sent = queue.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attempt, Some(1));

        // Second attempt exhausts the budget of 2 deliveries.
        let body = serde_json::to_string(&sent[0]).unwrap();
        queue.clear().await;
        dispatcher.process(Delivery::new(body)).await;
        assert!(queue.sent().await.is_empty());
    }

    #[tokio::test]
    async fn enqueue_fault_after_advance_redelivers_next_step() {
        let (controller, _store, queue) = testing::controller();
        controller.init("job-1", None).await.unwrap();
        queue.clear().await;
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller.clone(), exec.clone(), queue.clone(), 3);

        // The advance is persisted, then enqueueing the next step fails once.
        queue.fail_sends(1);
        dispatcher.process(delivery("job-1", Step::GenerateStory)).await;

        let state = controller.status("job-1").await.unwrap();
        assert_eq!(state.current_step, Some(Step::GenerateImages));
        let sent = queue.sent().await;
        assert_eq!(
            sent,
            vec![DispatchMessage {
                job_id: "job-1".into(),
                step: Step::GenerateImages,
                attempt: Some(1),
            }]
        );

        let body = serde_json::to_string(&sent[0]).unwrap();
        let outcome = dispatcher.handle(&Delivery::new(body)).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Reported(CompleteOutcome::Advanced(Step::GenerateNarration))
        );
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn backlog_past_capacity_does_not_stall_consumer() {
        let store = Arc::new(MemoryJobStore::new());
        let (queue, receiver) = ChannelQueue::new(2);
        let queue = Arc::new(queue);
        let controller = Arc::new(JobController::new(store, queue.clone()));
        let dispatcher = Arc::new(StepDispatcher::new(
            controller.clone(),
            Arc::new(MockStepExecutor::new(Arc::new(MemoryArtifactStore::new()))),
            queue,
            3,
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(receiver, 2, cancel.clone()));

        let mut inits = Vec::new();
        for i in 0..8 {
            let controller = controller.clone();
            inits.push(tokio::spawn(async move {
                let job_id = format!("job-{i}");
                let result = controller.init(&job_id, None).await;
                (job_id, result)
            }));
        }
        let mut started = Vec::new();
        for init in inits {
            let (job_id, result) = init.await.unwrap();
            match result {
                Ok(InitOutcome::Started(_)) => started.push(job_id),
                Err(PipelineError::Queue(QueueError::Full)) => {}
                other => panic!("unexpected init result for {job_id}: {other:?}"),
            }
        }
        assert!(!started.is_empty());

        tokio::time::timeout(Duration::from_secs(10), async {
            for job_id in &started {
                loop {
                    if controller.status(job_id).await.unwrap().status == JobStatus::Completed {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .await
        .expect("admitted jobs did not finish in time");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_drives_job_to_completion() {
        let store = Arc::new(MemoryJobStore::new());
        let (queue, receiver) = ChannelQueue::new(16);
        let queue = Arc::new(queue);
        let controller = Arc::new(JobController::new(store.clone(), queue.clone()));
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let dispatcher = Arc::new(StepDispatcher::new(
            controller.clone(),
            Arc::new(MockStepExecutor::new(artifacts.clone())),
            queue.clone(),
            3,
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(receiver, 4, cancel.clone()));

        controller.init("job-1", None).await.unwrap();
        // A stray duplicate of the first step must not disturb the run.
        queue
            .send(DispatchMessage::new("job-1", Step::GenerateStory))
            .await
            .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = controller.status("job-1").await.unwrap();
                if state.status.is_terminal() {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not finish in time");

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.completed_steps(), Step::ALL.to_vec());
        assert_eq!(
            state.artifacts.video.unwrap().key.as_deref(),
            Some("job-1/video/final.mp4")
        );
        assert_eq!(store.get("job-1").await.unwrap().unwrap().status, JobStatus::Completed);
        assert!(artifacts.keys().contains(&"job-1/story/story.txt".to_string()));
    }

    #[tokio::test]
    async fn run_step_bypasses_guards() {
        let (controller, _store, queue) = testing::controller();
        controller.init("job-1", None).await.unwrap();
        let exec = Arc::new(CountingExecutor::default());
        let dispatcher = StepDispatcher::new(controller.clone(), exec.clone(), queue, 3);

        // Out of order: executes, but the controller ignores the report.
        let run = dispatcher.run_step("job-1", Step::GenerateMusic).await.unwrap();
        assert!(matches!(run.outcome, CompleteOutcome::Ignored { .. }));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        let run = dispatcher.run_step("job-1", Step::GenerateStory).await.unwrap();
        assert_eq!(run.outcome, CompleteOutcome::Advanced(Step::GenerateImages));
        assert!(run.error.is_none());
    }
}
