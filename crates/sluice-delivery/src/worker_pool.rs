//! Worker pool supervision.
//!
//! Lifecycle management and graceful shutdown for the delivery workers. All
//! workers share one cancellation token; shutdown waits for in-flight
//! deliveries up to a deadline.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::WorkerContext,
    error::{DeliveryError, Result},
    worker::DeliveryWorker,
};

/// Supervised pool of delivery workers.
pub(crate) struct WorkerPool {
    context: Arc<WorkerContext>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool over the shared engine context.
    pub fn new(context: Arc<WorkerContext>, cancellation_token: CancellationToken) -> Self {
        Self { context, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns all configured workers.
    ///
    /// Workers run until the cancellation token fires. Returns immediately
    /// after spawning.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.context.config.worker_count, "spawning delivery workers");

        {
            let mut stats = self.context.stats.write().await;
            stats.active_workers = self.context.config.worker_count;
        }

        for worker_id in 0..self.context.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.context.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref err) = result {
                    error!(worker_id, error = %err, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Signals cancellation and waits for workers to finish within the
    /// deadline.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let context = self.context.clone();

        let drain = async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => {
                        warn!(worker_id, error = %err, "worker finished with error during shutdown");
                    },
                    Err(join_err) => {
                        error!(worker_id, error = %join_err, "worker task panicked");
                    },
                }
            }

            let mut stats = context.stats.write().await;
            stats.active_workers = 0;
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without graceful shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
