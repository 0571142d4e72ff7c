//! Job queue boundary.
//!
//! The engine consumes a durable, at-least-once queue as an external
//! collaborator: fanout and requeue write one job per delivery, workers are
//! woken to claim due deliveries from storage. No ordering is assumed across
//! deliveries, only that a written job is eventually attempted at least
//! once. Because the claim sweep also picks up due deliveries whose enqueue
//! failed, a queue-write error is logged and never rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sluice_core::models::DeliveryId;
use tokio::sync::{Mutex, Notify};

use crate::error::{DeliveryError, Result};

/// Task name for delivery dispatch jobs.
pub const TASK_DISPATCH: &str = "delivery.dispatch";

/// Default queue name for delivery jobs.
pub const QUEUE_DELIVERIES: &str = "deliveries";

/// A queued unit of work referencing one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Delivery this job refers to.
    pub id: DeliveryId,

    /// Opaque task payload carried alongside the identifier.
    pub payload: serde_json::Value,
}

impl Job {
    /// Creates a job for a delivery with an empty payload.
    pub fn new(id: DeliveryId) -> Self {
        Self { id, payload: serde_json::Value::Null }
    }
}

/// Asynchronous at-least-once job queue.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Writes a job. May redeliver; consumers must tolerate duplicates.
    async fn write(&self, task_name: &str, queue_name: &str, job: Job) -> Result<()>;
}

/// In-process queue for tests and single-node deployments.
///
/// Records every written job and wakes waiting workers through a
/// [`Notify`]. Duplicate writes are kept verbatim to mirror at-least-once
/// semantics.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<(String, String, Job)>>,
    notify: Arc<Notify>,
    fail_next: Mutex<Option<String>>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier workers can wait on to pick up new work promptly.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Injects an error for the next write, for failure-path tests.
    pub async fn inject_write_error(&self, message: impl Into<String>) {
        *self.fail_next.lock().await = Some(message.into());
    }

    /// All jobs written so far, in order.
    pub async fn written(&self) -> Vec<Job> {
        self.jobs.lock().await.iter().map(|(_, _, job)| job.clone()).collect()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn write(&self, task_name: &str, queue_name: &str, job: Job) -> Result<()> {
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(DeliveryError::queue(message));
        }

        self.jobs.lock().await.push((task_name.to_string(), queue_name.to_string(), job));
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn written_jobs_are_recorded_in_order() {
        let queue = InMemoryQueue::new();
        let first = DeliveryId::new();
        let second = DeliveryId::new();

        queue.write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(first)).await.unwrap();
        queue.write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(second)).await.unwrap();

        let written = queue.written().await;
        assert_eq!(written, vec![Job::new(first), Job::new(second)]);
    }

    #[tokio::test]
    async fn injected_error_fails_exactly_one_write() {
        let queue = InMemoryQueue::new();
        queue.inject_write_error("broker down").await;

        let err = queue
            .write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(DeliveryId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Queue { .. }));

        // Next write succeeds again.
        queue.write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(DeliveryId::new())).await.unwrap();
        assert_eq!(queue.written().await.len(), 1);
    }
}
