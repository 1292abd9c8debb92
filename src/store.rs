//! Durable job-record storage.
//!
//! [`JobStore`] is a last-write-wins key/value contract keyed by job id. The
//! controller is its only writer, so no compare-and-set is needed here.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::state_machine::JobState;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load the record for `job_id`, if one has ever been written.
    async fn get(&self, job_id: &str) -> Result<Option<JobState>, StoreError>;

    /// Replace the record for `state.job_id`.
    async fn put(&self, state: &JobState) -> Result<(), StoreError>;
}

/// In-process store, lost on restart.
#[derive(Default)]
pub struct MemoryJobStore {
    records: DashMap<String, JobState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobState>, StoreError> {
        Ok(self.records.get(job_id).map(|r| r.value().clone()))
    }

    async fn put(&self, state: &JobState) -> Result<(), StoreError> {
        self.records.insert(state.job_id.clone(), state.clone());
        Ok(())
    }
}

/// One JSON file per job under a directory.
///
/// Writes go to a temp file first and are renamed into place, so a reader
/// never sees a half-written record.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        if job_id.is_empty()
            || job_id.starts_with('.')
            || job_id.contains(['/', '\\'])
        {
            return Err(StoreError::Unavailable(format!(
                "job id {job_id:?} cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{job_id}.json")))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobState>, StoreError> {
        let path = self.path_for(job_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            job_id: job_id.to_string(),
            source,
        })?;
        Ok(Some(state))
    }

    async fn put(&self, state: &JobState) -> Result<(), StoreError> {
        let path = self.path_for(&state.job_id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(job_id = %state.job_id, path = %path.display(), "Job record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobStatus, Step};

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryJobStore::new();
        assert!(store.get("job-1").await.unwrap().is_none());

        let mut state = JobState::new("job-1");
        store.put(&state).await.unwrap();
        state.status = JobStatus::Running;
        state.current_step = Some(Step::GenerateStory);
        store.put(&state).await.unwrap();

        let loaded = store.get("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn file_store_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path().join("jobs")).await.unwrap();

        let mut state = JobState::new("job-42");
        state.status = JobStatus::Running;
        state.current_step = Some(Step::GenerateMusic);
        store.put(&state).await.unwrap();

        let loaded = store.get("job-42").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!store.dir().join("job-42.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_overwrite_replaces_record_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let mut state = JobState::new("job-7");
        store.put(&state).await.unwrap();
        state.status = JobStatus::Completed;
        store.put(&state).await.unwrap();

        let on_disk: JobState =
            serde_json::from_slice(&std::fs::read(dir.path().join("job-7.json")).unwrap()).unwrap();
        assert_eq!(on_disk.status, JobStatus::Completed);
        assert!(!dir.path().join("job-7.json.tmp").exists());
    }

    #[tokio::test]
    async fn file_store_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();

        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref job_id, .. } if job_id == "bad"));
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put(&JobState::new("a/b")).await.is_err());
    }
}
