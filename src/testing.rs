//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::controller::JobController;
use crate::error::{QueueError, StoreError};
use crate::queue::WorkQueue;
use crate::state_machine::{DispatchMessage, JobState};
use crate::store::{JobStore, MemoryJobStore};

/// Queue that records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingQueue {
    sent: Mutex<Vec<DispatchMessage>>,
    closed: AtomicBool,
    failures: AtomicUsize,
}

impl RecordingQueue {
    pub async fn sent(&self) -> Vec<DispatchMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    /// Make every further `send` fail with [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail, then deliver normally again.
    pub fn fail_sends(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    async fn send(&self, message: DispatchMessage) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Closed);
        }
        self.sent.lock().await.push(message);
        Ok(())
    }
}

/// Memory store whose writes can be switched off to simulate an outage.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryJobStore,
    writes_fail: AtomicBool,
}

impl FlakyStore {
    pub fn fail_writes(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobState>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn put(&self, state: &JobState) -> Result<(), StoreError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".into()));
        }
        self.inner.put(state).await
    }
}

/// A controller over a fresh memory store and a recording queue.
pub fn controller() -> (Arc<JobController>, Arc<MemoryJobStore>, Arc<RecordingQueue>) {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(RecordingQueue::default());
    let controller = Arc::new(JobController::new(store.clone(), queue.clone()));
    (controller, store, queue)
}
