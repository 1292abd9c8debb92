//! Step-dispatch message transport.
//!
//! Producers hand typed [`DispatchMessage`]s to a [`WorkQueue`]; consumers
//! receive raw JSON bodies, the same shape an external broker would deliver,
//! and decode them themselves. Delivery is at-least-once: the same message
//! may arrive more than once and in any order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::QueueError;
use crate::state_machine::DispatchMessage;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message. Never waits for a consumer to make room.
    async fn send(&self, message: DispatchMessage) -> Result<(), QueueError>;

    /// Whether the backlog leaves room to admit a new job. Messages for jobs
    /// already in flight are accepted regardless.
    fn accepting(&self) -> bool {
        true
    }
}

/// A single delivered message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
}

impl Delivery {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// In-process queue backed by an unbounded Tokio channel.
///
/// The dispatcher enqueues follow-up steps into the same channel it drains,
/// so sends must not block. `capacity` only limits admission of new jobs
/// through [`WorkQueue::accepting`].
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

/// Consumer half of a [`ChannelQueue`].
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Delivery>,
    depth: Arc<AtomicUsize>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let queue = Self {
            tx,
            depth: depth.clone(),
            capacity: capacity.max(1),
        };
        (queue, QueueReceiver { rx, depth })
    }

    /// Messages waiting to be received.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Push a raw body, bypassing encoding. Lets callers inject payloads
    /// from outside (and tests feed malformed ones).
    pub fn send_raw(&self, body: impl Into<String>) -> Result<(), QueueError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(Delivery::new(body)).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            QueueError::Closed
        })
    }
}

#[async_trait]
impl WorkQueue for ChannelQueue {
    async fn send(&self, message: DispatchMessage) -> Result<(), QueueError> {
        let body = serde_json::to_string(&message)?;
        self.send_raw(body)?;
        tracing::debug!(
            job_id = %message.job_id,
            step = %message.step,
            attempt = message.attempt.unwrap_or(0),
            depth = self.depth(),
            "Enqueued dispatch message",
        );
        Ok(())
    }

    fn accepting(&self) -> bool {
        self.depth() < self.capacity
    }
}

impl QueueReceiver {
    /// Next delivery, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let delivery = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(delivery)
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let delivery = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(delivery)
    }
}
