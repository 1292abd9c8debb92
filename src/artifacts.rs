//! Binary storage for generated media.
//!
//! Keys follow `{jobId}/{category}/{filename}`; see [`artifact_key`].

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ArtifactError;

pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
pub const CONTENT_TYPE_MPEG: &str = "audio/mpeg";
pub const CONTENT_TYPE_MP4: &str = "video/mp4";

/// A stored object and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ArtifactError>;

    async fn get(&self, key: &str) -> Result<StoredArtifact, ArtifactError>;
}

/// Build a storage key for one artifact of one job.
pub fn artifact_key(job_id: &str, category: &str, filename: &str) -> String {
    format!("{job_id}/{category}/{filename}")
}

fn validate_key(key: &str) -> Result<(), ArtifactError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(ArtifactError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, StoredArtifact>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), ArtifactError> {
        validate_key(key)?;
        self.objects.insert(
            key.to_string(),
            StoredArtifact {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredArtifact, ArtifactError> {
        self.objects
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }
}

/// Artifacts as plain files under a root directory.
///
/// The filesystem has no content-type metadata, so [`get`](ArtifactStore::get)
/// infers it from the file extension.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("txt") => CONTENT_TYPE_TEXT,
        Some("json") => CONTENT_TYPE_JSON,
        Some("jpg") | Some("jpeg") => CONTENT_TYPE_JPEG,
        Some("mp3") => CONTENT_TYPE_MPEG,
        Some("mp4") => CONTENT_TYPE_MP4,
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), ArtifactError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredArtifact, ArtifactError> {
        validate_key(key)?;
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(StoredArtifact {
                bytes,
                content_type: content_type_for(key).to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
