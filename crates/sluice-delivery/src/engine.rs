//! Delivery engine configuration and lifecycle.
//!
//! The engine wires storage, the dispatch client, the rate limiter, and the
//! health state machine into a supervised worker pool, and vends the
//! synchronous services (fanout, manual operations) built on the same
//! components.

use std::{sync::Arc, time::Duration};

use sluice_core::{models::RateLimitConfig, time::Clock};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    dispatch::{ClientConfig, DispatcherClient},
    error::Result,
    fanout::FanoutResolver,
    health::HealthService,
    queue::TaskQueue,
    rate_limit::RateLimiter,
    retry::RetryPolicy,
    status::ManualOps,
    storage::DeliveryStorage,
    transform::PayloadTransform,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum deliveries to claim per worker batch.
    pub batch_size: usize,

    /// How often workers poll for due deliveries.
    pub poll_interval: Duration,

    /// Dispatch client configuration.
    pub client_config: ClientConfig,

    /// Project default retry policy; subscriptions may override.
    pub default_retry: RetryPolicy,

    /// Project default rate limit; endpoints and subscriptions may
    /// override. `None` disables rate limiting by default.
    pub default_rate_limit: Option<RateLimitConfig>,

    /// Hard execution budget for tenant payload transforms.
    pub transform_timeout: Duration,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            client_config: ClientConfig::default(),
            default_retry: RetryPolicy::default(),
            default_rate_limit: None,
            transform_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,

    /// Deliveries processed since startup.
    pub deliveries_processed: u64,

    /// Successful dispatches.
    pub successful_deliveries: u64,

    /// Failed attempts that scheduled a retry.
    pub retries_scheduled: u64,

    /// Terminal failures (budget exhausted or non-retryable).
    pub permanent_failures: u64,

    /// Dispatches deferred by rate limiting.
    pub deferred_dispatches: u64,

    /// Deliveries currently in flight.
    pub in_flight_deliveries: u64,
}

/// Shared components handed to every worker.
pub(crate) struct WorkerContext {
    pub storage: Arc<dyn DeliveryStorage>,
    pub config: DeliveryConfig,
    pub client: Arc<DispatcherClient>,
    pub rate_limiter: Arc<RateLimiter>,
    pub health: Arc<HealthService>,
    pub stats: Arc<RwLock<EngineStats>>,
    pub clock: Arc<dyn Clock>,
    pub sandbox: Option<Arc<dyn PayloadTransform>>,
    pub wakeup: Option<Arc<Notify>>,
}

/// Main delivery engine coordinating dispatch workers.
pub struct DeliveryEngine {
    context: Arc<WorkerContext>,
    queue: Arc<dyn TaskQueue>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine over an explicit storage boundary.
    ///
    /// Every collaborator is injected: production wires the PostgreSQL
    /// storage adapter and a real queue, tests wire the in-memory pair. An
    /// optional `wakeup` notifier lets workers react to queue writes ahead
    /// of their poll interval.
    ///
    /// # Errors
    ///
    /// Returns error if the dispatch client cannot be initialized.
    pub fn with_storage(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        sandbox: Option<Arc<dyn PayloadTransform>>,
        wakeup: Option<Arc<Notify>>,
    ) -> Result<Self> {
        let client = Arc::new(DispatcherClient::new(config.client_config.clone())?);
        let rate_limiter = Arc::new(RateLimiter::new(clock.clone()));
        let health = Arc::new(HealthService::new(storage.clone()));
        let stats = Arc::new(RwLock::new(EngineStats::default()));

        let context = Arc::new(WorkerContext {
            storage,
            config,
            client,
            rate_limiter,
            health,
            stats,
            clock,
            sandbox,
            wakeup,
        });

        Ok(Self {
            context,
            queue,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Starts the configured worker pool.
    ///
    /// Returns immediately after spawning workers; use [`shutdown`] to stop
    /// gracefully.
    ///
    /// [`shutdown`]: DeliveryEngine::shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.context.config.worker_count,
            batch_size = self.context.config.batch_size,
            "starting delivery engine"
        );

        let mut pool = WorkerPool::new(self.context.clone(), self.cancellation_token.clone());
        pool.spawn_workers().await?;
        self.worker_pool = Some(pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Gracefully shuts down, letting in-flight deliveries complete within
    /// the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if shutdown exceeds the timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.context.config.shutdown_timeout).await?;
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Processes exactly one batch of due deliveries synchronously.
    ///
    /// Intended for tests and controlled draining: no background workers are
    /// started.
    ///
    /// # Errors
    ///
    /// Returns error if claiming the batch fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = crate::worker::DeliveryWorker::new(
            0,
            self.context.clone(),
            self.cancellation_token.clone(),
        );
        worker.process_batch().await
    }

    /// Fanout resolver sharing this engine's storage and queue.
    pub fn fanout_resolver(&self) -> FanoutResolver {
        FanoutResolver::new(
            self.context.storage.clone(),
            self.queue.clone(),
            self.context.clock.clone(),
        )
    }

    /// Manual-operations service sharing this engine's components.
    pub fn manual_ops(&self) -> ManualOps {
        ManualOps::new(
            self.context.storage.clone(),
            self.queue.clone(),
            self.context.health.clone(),
            self.context.clock.clone(),
        )
    }

    /// Health service for operator endpoint actions.
    pub fn health(&self) -> Arc<HealthService> {
        self.context.health.clone()
    }
}
