//! Content generation for individual steps.
//!
//! The orchestration core only sees the [`StepExecutor`] contract: given a
//! step, the job's config and the artifacts so far, produce new artifacts or
//! fail. [`MockStepExecutor`] fills the artifact store with placeholder
//! media so the whole pipeline can run without any external provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::json;

use crate::artifacts::{
    ArtifactStore, CONTENT_TYPE_JPEG, CONTENT_TYPE_JSON, CONTENT_TYPE_MP4, CONTENT_TYPE_MPEG,
    CONTENT_TYPE_TEXT, artifact_key,
};
use crate::error::StepError;
use crate::state_machine::{
    AssemblyProvider, ImageProvider, JobArtifacts, JobConfig, KeyList, MusicProvider,
    NarrationProvider, SingleKey, Step, StoryArtifact, StoryProvider, VideoArtifact,
};

const IMAGE_BYTES: usize = 1024;
const AUDIO_BYTES: usize = 2048;
const VIDEO_BYTES: usize = 4096;

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        job_id: &str,
        step: Step,
        config: &JobConfig,
        artifacts: &JobArtifacts,
    ) -> Result<JobArtifacts, StepError>;
}

/// Writes placeholder content for every step.
///
/// Only the `mock` providers (plus `template` stories and `manifest`
/// assembly) are wired; selecting any other provider fails the step.
pub struct MockStepExecutor {
    store: Arc<dyn ArtifactStore>,
}

impl MockStepExecutor {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    async fn story(&self, job_id: &str, config: &JobConfig) -> Result<JobArtifacts, StepError> {
        let text = match config.story.provider {
            StoryProvider::Mock | StoryProvider::Template => format!(
                "Once upon a time, {} embarked on a journey through the clouds.",
                config.story.prompt.trim()
            ),
            other => return Err(unsupported(Step::GenerateStory, &other)),
        };

        let key = artifact_key(job_id, Step::GenerateStory.category(), "story.txt");
        self.store
            .put(&key, text.into_bytes(), CONTENT_TYPE_TEXT)
            .await?;
        Ok(JobArtifacts {
            story: Some(StoryArtifact { text_key: key }),
            ..Default::default()
        })
    }

    async fn images(&self, job_id: &str, config: &JobConfig) -> Result<JobArtifacts, StepError> {
        if config.images.provider != ImageProvider::Mock {
            return Err(unsupported(Step::GenerateImages, &config.images.provider));
        }

        let mut keys = Vec::with_capacity(config.images.count as usize);
        for i in 1..=config.images.count {
            let key = artifact_key(job_id, Step::GenerateImages.category(), &format!("frame_{i}.jpg"));
            self.store
                .put(&key, placeholder_bytes(IMAGE_BYTES), CONTENT_TYPE_JPEG)
                .await?;
            keys.push(key);
        }
        Ok(JobArtifacts {
            images: Some(KeyList { keys }),
            ..Default::default()
        })
    }

    async fn narration(&self, job_id: &str, config: &JobConfig) -> Result<JobArtifacts, StepError> {
        if config.narration.provider != NarrationProvider::Mock {
            return Err(unsupported(Step::GenerateNarration, &config.narration.provider));
        }

        let key = artifact_key(job_id, Step::GenerateNarration.category(), "narration.mp3");
        self.store
            .put(&key, placeholder_bytes(AUDIO_BYTES), CONTENT_TYPE_MPEG)
            .await?;
        Ok(JobArtifacts {
            narration: Some(KeyList { keys: vec![key] }),
            ..Default::default()
        })
    }

    async fn music(&self, job_id: &str, config: &JobConfig) -> Result<JobArtifacts, StepError> {
        if config.music.provider != MusicProvider::Mock {
            return Err(unsupported(Step::GenerateMusic, &config.music.provider));
        }

        let key = artifact_key(job_id, Step::GenerateMusic.category(), "theme.mp3");
        self.store
            .put(&key, placeholder_bytes(AUDIO_BYTES), CONTENT_TYPE_MPEG)
            .await?;
        Ok(JobArtifacts {
            music: Some(SingleKey { key }),
            ..Default::default()
        })
    }

    async fn assemble(
        &self,
        job_id: &str,
        config: &JobConfig,
        artifacts: &JobArtifacts,
    ) -> Result<JobArtifacts, StepError> {
        let step = Step::AssembleOutput;
        if artifacts.story.is_none() {
            return Err(StepError::MissingInput { step, input: "story" });
        }
        if artifacts.images.is_none() {
            return Err(StepError::MissingInput { step, input: "images" });
        }
        if artifacts.narration.is_none() {
            return Err(StepError::MissingInput { step, input: "narration" });
        }

        let video = match config.assembly.provider {
            AssemblyProvider::Manifest => {
                let key = artifact_key(job_id, step.category(), "manifest.json");
                let manifest = json!({
                    "jobId": job_id,
                    "artifacts": artifacts,
                    "generatedAt": Utc::now().to_rfc3339(),
                });
                self.store
                    .put(&key, serde_json::to_vec_pretty(&manifest)?, CONTENT_TYPE_JSON)
                    .await?;
                VideoArtifact {
                    key: None,
                    manifest_key: Some(key),
                }
            }
            AssemblyProvider::Mock => {
                let key = artifact_key(job_id, step.category(), "final.mp4");
                self.store
                    .put(&key, placeholder_bytes(VIDEO_BYTES), CONTENT_TYPE_MP4)
                    .await?;
                VideoArtifact {
                    key: Some(key),
                    manifest_key: None,
                }
            }
            other => return Err(unsupported(step, &other)),
        };

        Ok(JobArtifacts {
            video: Some(video),
            ..Default::default()
        })
    }
}

#[async_trait]
impl StepExecutor for MockStepExecutor {
    async fn execute(
        &self,
        job_id: &str,
        step: Step,
        config: &JobConfig,
        artifacts: &JobArtifacts,
    ) -> Result<JobArtifacts, StepError> {
        match step {
            Step::GenerateStory => self.story(job_id, config).await,
            Step::GenerateImages => self.images(job_id, config).await,
            Step::GenerateNarration => self.narration(job_id, config).await,
            Step::GenerateMusic => self.music(job_id, config).await,
            Step::AssembleOutput => self.assemble(job_id, config, artifacts).await,
        }
    }
}

fn unsupported<P: Serialize>(step: Step, provider: &P) -> StepError {
    let provider = serde_json::to_value(provider)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    StepError::UnsupportedProvider { step, provider }
}

fn placeholder_bytes(size: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; size];
    rand::rng().fill(&mut bytes[..]);
    bytes
}
