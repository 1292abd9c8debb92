use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::Step;
use crate::error::PipelineError;

/// Upper bound on frames a single job may request.
pub const MAX_IMAGE_COUNT: u32 = 32;

/// Job-level lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-step status. Moves `Pending → Completed` or `Pending → Failed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryProvider {
    Mock,
    Openai,
    Anthropic,
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageProvider {
    Mock,
    Sdxl,
    Cloudflare,
    R2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrationProvider {
    Mock,
    Openai,
    Elevenlabs,
    Cloudflare,
    R2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MusicProvider {
    Mock,
    Aiva,
    Stock,
    R2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyProvider {
    Mock,
    External,
    Webcodecs,
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryOptions {
    pub provider: StoryProvider,
    pub prompt: String,
}

impl Default for StoryOptions {
    fn default() -> Self {
        Self {
            provider: StoryProvider::Mock,
            prompt: "a curious explorer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    pub provider: ImageProvider,
    pub count: u32,
    pub style: Option<String>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            provider: ImageProvider::Mock,
            count: 5,
            style: Some("cinematic".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrationOptions {
    pub provider: NarrationProvider,
    pub voice: Option<String>,
}

impl Default for NarrationOptions {
    fn default() -> Self {
        Self {
            provider: NarrationProvider::Mock,
            voice: Some("neutral".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicOptions {
    pub provider: MusicProvider,
    pub mood: Option<String>,
}

impl Default for MusicOptions {
    fn default() -> Self {
        Self {
            provider: MusicProvider::Mock,
            mood: Some("uplifting".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    pub provider: AssemblyProvider,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            provider: AssemblyProvider::Mock,
        }
    }
}

/// Per-capability options for a job. Fixed once the job is initialized.
///
/// Every block is `#[serde(default)]`, so a request body may carry only the
/// fields it wants to override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub story: StoryOptions,
    pub images: ImageOptions,
    pub narration: NarrationOptions,
    pub music: MusicOptions,
    pub assembly: AssemblyOptions,
}

impl JobConfig {
    /// Reject configurations no step could ever satisfy.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.story.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "story prompt must not be empty".into(),
            ));
        }
        if self.images.count == 0 || self.images.count > MAX_IMAGE_COUNT {
            return Err(PipelineError::InvalidConfig(format!(
                "image count must be between 1 and {MAX_IMAGE_COUNT}, got {}",
                self.images.count
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryArtifact {
    pub text_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyList {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleKey {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoArtifact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_key: Option<String>,
}

/// Outputs accumulated by completed steps. Each step owns one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<StoryArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<KeyList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narration: Option<KeyList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music: Option<SingleKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoArtifact>,
}

impl JobArtifacts {
    /// Fold `other` into `self`. Fields `other` leaves unset are kept as is.
    pub fn merge(&mut self, other: JobArtifacts) {
        if other.story.is_some() {
            self.story = other.story;
        }
        if other.images.is_some() {
            self.images = other.images;
        }
        if other.narration.is_some() {
            self.narration = other.narration;
        }
        if other.music.is_some() {
            self.music = other.music;
        }
        if other.video.is_some() {
            self.video = other.video;
        }
    }

    /// Every storage key referenced by these artifacts.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        if let Some(story) = &self.story {
            keys.push(story.text_key.as_str());
        }
        if let Some(images) = &self.images {
            keys.extend(images.keys.iter().map(String::as_str));
        }
        if let Some(narration) = &self.narration {
            keys.extend(narration.keys.iter().map(String::as_str));
        }
        if let Some(music) = &self.music {
            keys.push(music.key.as_str());
        }
        if let Some(video) = &self.video {
            keys.extend(video.key.as_deref());
            keys.extend(video.manifest_key.as_deref());
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        *self == JobArtifacts::default()
    }
}

/// The authoritative record for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub current_step: Option<Step>,
    pub config: JobConfig,
    pub artifacts: JobArtifacts,
    pub step_status: BTreeMap<Step, StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    /// A never-initialized job: pending, every step pending, default config.
    pub fn new(job_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            current_step: None,
            config: JobConfig::default(),
            artifacts: JobArtifacts::default(),
            step_status: all_pending(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_status(&self, step: Step) -> StepStatus {
        self.step_status
            .get(&step)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    /// Steps that reached `Completed`, in catalog order.
    pub fn completed_steps(&self) -> Vec<Step> {
        Step::ALL
            .into_iter()
            .filter(|s| self.step_status(*s) == StepStatus::Completed)
            .collect()
    }
}

/// A step-status map with every catalog step set to `Pending`.
pub fn all_pending() -> BTreeMap<Step, StepStatus> {
    Step::ALL
        .into_iter()
        .map(|s| (s, StepStatus::Pending))
        .collect()
}

/// Queue payload instructing the dispatcher to run one step of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub job_id: String,
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl DispatchMessage {
    pub fn new(job_id: impl Into<String>, step: Step) -> Self {
        Self {
            job_id: job_id.into(),
            step,
            attempt: None,
        }
    }

    /// A follow-up delivery for the same job, aimed at `step` and counted as
    /// one attempt later.
    pub fn redelivery(&self, step: Step) -> Self {
        Self {
            job_id: self.job_id.clone(),
            step,
            attempt: Some(self.attempt.unwrap_or(0) + 1),
        }
    }
}

/// Structured report produced once a job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub completed_steps: Vec<Step>,
    pub failed_step: Option<Step>,
    pub artifact_count: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobSummary {
    pub fn from_state(job: &JobState) -> Self {
        let failed_step = Step::ALL
            .into_iter()
            .find(|s| job.step_status(*s) == StepStatus::Failed);

        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            completed_steps: job.completed_steps(),
            failed_step,
            artifact_count: job.artifacts.keys().len(),
            error: job.error.clone(),
            started_at: job.created_at,
            finished_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}
