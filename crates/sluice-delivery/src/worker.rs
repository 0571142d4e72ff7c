//! Delivery worker.
//!
//! Workers claim due deliveries (the claim is the per-delivery mutual
//! exclusion point), apply rate limiting, run the tenant transform, dispatch
//! the signed callback, and feed the outcome through the retry engine into
//! delivery status and endpoint health updates.

use std::sync::Arc;

use sluice_core::models::{
    DeliveryMode, DeliveryResponse, Endpoint, EndpointStatus, Event, EventDelivery,
    RateLimitConfig, Subscription,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::DispatchRequest,
    engine::WorkerContext,
    error::{DeliveryError, Result},
    rate_limit::RateDecision,
    retry::{next_action, NextAction, RetryPolicy},
    transform::Transformer,
};

/// Individual worker processing delivery jobs.
pub(crate) struct DeliveryWorker {
    id: usize,
    ctx: Arc<WorkerContext>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker over the shared engine context.
    pub fn new(id: usize, ctx: Arc<WorkerContext>, cancellation_token: CancellationToken) -> Self {
        Self { id, ctx, cancellation_token }
    }

    /// Main worker loop: claims and processes deliveries until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => self.idle().await,
                Ok(_) => {},
                Err(err) => {
                    error!(worker_id = self.id, error = %err, "worker batch processing failed");
                    self.idle().await;
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Waits for the poll interval, a queue wakeup, or cancellation.
    async fn idle(&self) {
        match &self.ctx.wakeup {
            Some(notify) => {
                tokio::select! {
                    () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {},
                    () = notify.notified() => {},
                    () = self.cancellation_token.cancelled() => {},
                }
            },
            None => {
                tokio::select! {
                    () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {},
                    () = self.cancellation_token.cancelled() => {},
                }
            },
        }
    }

    /// Claims and processes one batch of due deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails; individual delivery failures are
    /// absorbed into delivery state.
    pub async fn process_batch(&self) -> Result<usize> {
        let now = self.ctx.clock.now();
        let deliveries = self
            .ctx
            .storage
            .claim_due(self.ctx.config.batch_size, now)
            .await
            .map_err(|e| DeliveryError::storage(format!("failed to claim due deliveries: {e}")))?;

        let batch_size = deliveries.len();
        debug!(worker_id = self.id, batch_size, "processing delivery batch");

        for delivery in deliveries {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.process_delivery(delivery).await;
        }

        Ok(batch_size)
    }

    /// Runs one claimed delivery through the dispatch pipeline.
    ///
    /// Never propagates: every path ends in a delivery state update. The
    /// asynchronous dispatch path has no synchronous caller to fail.
    async fn process_delivery(&self, delivery: EventDelivery) {
        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight_deliveries += 1;
        }

        if let Err(err) = self.attempt(&delivery).await {
            // Lookup or storage failures: park the delivery as a terminal
            // failure so it stays visible for operators instead of leaking
            // a Processing row.
            warn!(
                worker_id = self.id,
                delivery_id = %delivery.id,
                error = %err,
                "delivery pipeline error"
            );
            let response = DeliveryResponse {
                status_code: None,
                latency_ms: None,
                error: Some(err.to_string()),
            };
            if let Err(storage_err) = self
                .ctx
                .storage
                .record_failure(delivery.id, delivery.attempts, &response)
                .await
            {
                error!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    error = %storage_err,
                    "failed to park delivery after pipeline error"
                );
            }
        }

        let mut stats = self.ctx.stats.write().await;
        stats.in_flight_deliveries -= 1;
        stats.deliveries_processed += 1;
    }

    async fn attempt(&self, delivery: &EventDelivery) -> Result<()> {
        let storage = &self.ctx.storage;

        let endpoint = storage
            .find_endpoint(delivery.endpoint_id)
            .await
            .map_err(|e| DeliveryError::storage(e.to_string()))?
            .ok_or_else(|| {
                DeliveryError::configuration(format!("endpoint {} not found", delivery.endpoint_id))
            })?;
        let subscription = storage
            .find_subscription(delivery.subscription_id)
            .await
            .map_err(|e| DeliveryError::storage(e.to_string()))?
            .ok_or_else(|| {
                DeliveryError::configuration(format!(
                    "subscription {} not found",
                    delivery.subscription_id
                ))
            })?;
        let event = storage
            .find_event(delivery.event_id)
            .await
            .map_err(|e| DeliveryError::storage(e.to_string()))?
            .ok_or_else(|| {
                DeliveryError::configuration(format!("event {} not found", delivery.event_id))
            })?;

        // Endpoint health gates dispatch. Inactive endpoints take no
        // traffic: the delivery fails terminally and a later resend drives
        // the re-activation probe. A Pending endpoint has exactly one probe
        // outstanding; everything else waits for its verdict.
        match endpoint.status {
            EndpointStatus::Active => {},
            EndpointStatus::Pending if delivery.probe => {},
            EndpointStatus::Pending => {
                let wait = self.ctx.config.default_retry.duration;
                self.defer(delivery, wait).await?;
                return Ok(());
            },
            EndpointStatus::Inactive => {
                let response = DeliveryResponse {
                    status_code: None,
                    latency_ms: None,
                    error: Some("endpoint is inactive".to_string()),
                };
                storage
                    .record_failure(delivery.id, delivery.attempts, &response)
                    .await
                    .map_err(|e| DeliveryError::storage(e.to_string()))?;
                debug!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    "delivery to inactive endpoint failed without dispatch"
                );
                return Ok(());
            },
        }

        if let Some(config) = self.effective_rate_limit(&endpoint, &subscription) {
            let key = endpoint.id.to_string();
            if let RateDecision::Deferred(wait) =
                self.ctx.rate_limiter.try_acquire(&key, &config).await
            {
                self.defer(delivery, wait).await?;
                {
                    let mut stats = self.ctx.stats.write().await;
                    stats.deferred_dispatches += 1;
                }
                debug!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    wait_ms = wait.as_millis() as u64,
                    "dispatch deferred by rate limit"
                );
                return Ok(());
            }
        }

        self.dispatch(delivery, &endpoint, &subscription, &event).await
    }

    async fn dispatch(
        &self,
        delivery: &EventDelivery,
        endpoint: &Endpoint,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<()> {
        let now = self.ctx.clock.now();
        let attempts = delivery.attempts + 1;

        let transformer = Transformer::for_config(
            &subscription.transform.0,
            self.ctx.sandbox.clone(),
            self.ctx.config.transform_timeout,
        );
        let payload = match transformer.apply(event, event.payload_bytes()).await {
            Ok(payload) => payload,
            Err(err) => {
                return self.finish_failure(delivery, endpoint, attempts, None, err).await;
            },
        };

        let secrets: Vec<String> =
            endpoint.valid_secrets(now).into_iter().map(|s| s.value.clone()).collect();
        if secrets.is_empty() {
            let err = DeliveryError::configuration(format!(
                "endpoint {} has no valid signing secret",
                endpoint.id
            ));
            return self.finish_failure(delivery, endpoint, attempts, None, err).await;
        }

        let request = DispatchRequest {
            delivery_id: delivery.id.0,
            event_id: event.id.0,
            url: endpoint.url.clone(),
            headers: event.headers().clone(),
            payload,
            secrets,
            signature_header: endpoint.signature_header.clone(),
            advanced_signatures: endpoint.advanced_signatures,
            attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
            timeout: endpoint.timeout(),
        };

        let outcome = self.ctx.client.send(request).await;
        let response = DeliveryResponse {
            status_code: outcome.status_code.map(i32::from),
            latency_ms: i64::try_from(outcome.latency.as_millis()).ok(),
            error: outcome.error.as_ref().map(ToString::to_string),
        };

        if outcome.success {
            self.ctx
                .storage
                .record_success(delivery.id, attempts, &response)
                .await
                .map_err(|e| DeliveryError::storage(e.to_string()))?;

            {
                let mut stats = self.ctx.stats.write().await;
                stats.successful_deliveries += 1;
            }

            if delivery.probe {
                self.ctx.health.resolve_probe(endpoint.id, true).await;
            }

            info!(
                worker_id = self.id,
                delivery_id = %delivery.id,
                status_code = outcome.status_code,
                latency_ms = outcome.latency.as_millis() as u64,
                "delivery succeeded"
            );
            return Ok(());
        }

        let err = outcome
            .error
            .unwrap_or_else(|| DeliveryError::network("dispatch failed without classification"));

        if err.is_retryable() {
            self.finish_retryable(delivery, endpoint, subscription, attempts, &response, err).await
        } else {
            self.finish_failure(delivery, endpoint, attempts, Some(&response), err).await
        }
    }

    async fn finish_retryable(
        &self,
        delivery: &EventDelivery,
        endpoint: &Endpoint,
        subscription: &Subscription,
        attempts: i32,
        response: &DeliveryResponse,
        err: DeliveryError,
    ) -> Result<()> {
        let now = self.ctx.clock.now();
        let policy = self.effective_policy(subscription);

        // A probe is a single delivery: its first outcome settles the
        // endpoint's fate, so it never re-enters the retry schedule.
        let mode =
            if delivery.probe { DeliveryMode::AtMostOnce } else { subscription.delivery_mode };

        let attempt_number = u32::try_from(attempts).unwrap_or(u32::MAX);
        match next_action(&policy, mode, attempt_number, now) {
            NextAction::ScheduleRetry(at) => {
                self.ctx
                    .storage
                    .record_retry(delivery.id, attempts, at, response)
                    .await
                    .map_err(|e| DeliveryError::storage(e.to_string()))?;

                {
                    let mut stats = self.ctx.stats.write().await;
                    stats.retries_scheduled += 1;
                }

                warn!(
                    worker_id = self.id,
                    delivery_id = %delivery.id,
                    attempt = attempts,
                    next_attempt_at = %at,
                    error = %err,
                    "delivery failed, retry scheduled"
                );
                Ok(())
            },
            NextAction::Fail => {
                self.finish_failure(delivery, endpoint, attempts, Some(response), err).await
            },
        }
    }

    async fn finish_failure(
        &self,
        delivery: &EventDelivery,
        endpoint: &Endpoint,
        attempts: i32,
        response: Option<&DeliveryResponse>,
        err: DeliveryError,
    ) -> Result<()> {
        let response = response.cloned().unwrap_or_else(|| DeliveryResponse {
            status_code: None,
            latency_ms: None,
            error: Some(err.to_string()),
        });

        self.ctx
            .storage
            .record_failure(delivery.id, attempts, &response)
            .await
            .map_err(|e| DeliveryError::storage(e.to_string()))?;

        {
            let mut stats = self.ctx.stats.write().await;
            stats.permanent_failures += 1;
        }

        if delivery.probe {
            self.ctx.health.resolve_probe(endpoint.id, false).await;
        } else {
            self.ctx.health.note_delivery_exhausted(endpoint.id).await;
        }

        error!(
            worker_id = self.id,
            delivery_id = %delivery.id,
            attempt = attempts,
            error = %err,
            "delivery permanently failed"
        );
        Ok(())
    }

    async fn defer(&self, delivery: &EventDelivery, wait: std::time::Duration) -> Result<()> {
        let next_attempt_at = self.ctx.clock.now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        self.ctx
            .storage
            .defer_delivery(delivery.id, next_attempt_at)
            .await
            .map_err(|e| DeliveryError::storage(e.to_string()))?;
        Ok(())
    }

    fn effective_policy(&self, subscription: &Subscription) -> RetryPolicy {
        subscription
            .retry
            .as_ref()
            .map_or_else(|| self.ctx.config.default_retry.clone(), |r| RetryPolicy::from_config(&r.0))
    }

    fn effective_rate_limit(
        &self,
        endpoint: &Endpoint,
        subscription: &Subscription,
    ) -> Option<RateLimitConfig> {
        endpoint
            .rate_limit
            .as_ref()
            .map(|r| r.0)
            .or_else(|| subscription.rate_limit.as_ref().map(|r| r.0))
            .or(self.ctx.config.default_rate_limit)
    }
}
