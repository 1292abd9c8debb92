//! storyreel configuration loaded from `storyreel.toml`.
//!
//! [`StoryreelConfig`] holds every tunable setting. Values missing from the
//! file fall back to defaults. `STORYREEL_*` environment variables (a `.env`
//! file is honoured) take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "storyreel.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct StoryreelConfig {
    /// HTTP bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding one JSON record per job.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory for generated artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Messages processed concurrently by the dispatcher.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the in-process work queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Deliveries of one message before it is given up after infrastructure faults.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Upper bound on handling one HTTP request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long `storyreel run` waits for a job to reach a terminal state.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".storyreel/jobs")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".storyreel/artifacts")
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_run_timeout_secs() -> u64 {
    300
}

impl Default for StoryreelConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            artifact_dir: default_artifact_dir(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_delivery_attempts: default_max_delivery_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

impl StoryreelConfig {
    /// Load from `path` (or `storyreel.toml` in the working directory), then
    /// apply environment overrides. A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<StoryreelConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `STORYREEL_*` overrides read through `lookup`.
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), PipelineError> {
        if let Some(host) = lookup("STORYREEL_HOST").filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(port) = lookup("STORYREEL_PORT") {
            self.port = parse_var("STORYREEL_PORT", &port)?;
        }
        if let Some(dir) = lookup("STORYREEL_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("STORYREEL_ARTIFACT_DIR").filter(|v| !v.is_empty()) {
            self.artifact_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("STORYREEL_WORKERS") {
            self.workers = parse_var("STORYREEL_WORKERS", &workers)?;
        }
        if let Some(capacity) = lookup("STORYREEL_QUEUE_CAPACITY") {
            self.queue_capacity = parse_var("STORYREEL_QUEUE_CAPACITY", &capacity)?;
        }
        if let Some(attempts) = lookup("STORYREEL_MAX_DELIVERY_ATTEMPTS") {
            self.max_delivery_attempts = parse_var("STORYREEL_MAX_DELIVERY_ATTEMPTS", &attempts)?;
        }
        if let Some(secs) = lookup("STORYREEL_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_var("STORYREEL_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("STORYREEL_RUN_TIMEOUT_SECS") {
            self.run_timeout_secs = parse_var("STORYREEL_RUN_TIMEOUT_SECS", &secs)?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PipelineError> {
    value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Config(format!("{key} has invalid value {value:?}")))
}
