use thiserror::Error;

use crate::state_machine::Step;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Job id must not be empty")]
    InvalidJobId,

    #[error("Invalid job config: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Work queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures of the durable job-record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record for job {job_id} is unreadable: {source}")]
    Corrupt {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the work queue transport.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of the artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact key: {0:?}")]
    InvalidKey(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A step that ran but could not produce its output.
///
/// These are recorded on the job as a terminal failure, never retried here.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{step}: provider '{provider}' is not available")]
    UnsupportedProvider { step: Step, provider: String },

    #[error("{step}: missing input artifact '{input}'")]
    MissingInput { step: Step, input: &'static str },

    #[error("artifact store: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("failed to encode artifact: {0}")]
    Encode(#[from] serde_json::Error),
}
