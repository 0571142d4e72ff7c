//! Delivery lifecycle transitions and manual operator actions.
//!
//! All status guards live in one transition function so resend,
//! force-resend, batch retry, cancellation, and the worker's own attempt
//! lifecycle share a single source of truth instead of re-implementing
//! overlapping predicates. [`ManualOps`] layers the operator actions on
//! top, including the endpoint-side guards and the re-activation probe
//! side effect.

use std::sync::Arc;

use sluice_core::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryQuery, DeliveryStatus, EndpointStatus, EventDelivery},
    time::Clock,
};
use tracing::{debug, info, warn};

use crate::{
    health::{EndpointAction, HealthService},
    queue::{Job, TaskQueue, QUEUE_DELIVERIES, TASK_DISPATCH},
    storage::DeliveryStorage,
};

/// Page size used when walking batch-retry listings.
const BATCH_PAGE_SIZE: u32 = 1000;

/// Actions that drive the delivery status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    /// A worker claims the delivery for dispatch.
    BeginAttempt,

    /// The attempt was acknowledged with a 2xx.
    Succeed,

    /// The attempt failed retryably and the next attempt is scheduled.
    ScheduleRetry,

    /// The retry budget is exhausted or the failure is non-retryable.
    Exhaust,

    /// Dispatch deferred by rate limiting; back to the queue, no attempt
    /// counted.
    Defer,

    /// Operator resend; legal only from Failure.
    Resend,

    /// Operator force-resend; bypasses the Failure-only guard.
    ForceResend,

    /// Cancellation before dispatch (e.g. endpoint deleted).
    Cancel,
}

/// Computes the next delivery status for an action.
///
/// Rejections carry the exact operator-facing guard messages.
pub fn transition(current: DeliveryStatus, action: DeliveryAction) -> Result<DeliveryStatus> {
    use DeliveryAction as A;
    use DeliveryStatus as S;

    match (current, action) {
        (S::Scheduled | S::Retry, A::BeginAttempt) => Ok(S::Processing),
        (S::Processing, A::Succeed) => Ok(S::Success),
        (S::Processing, A::ScheduleRetry) => Ok(S::Retry),
        (S::Processing, A::Exhaust) => Ok(S::Failure),
        (S::Processing, A::Defer) => Ok(S::Scheduled),

        (S::Failure, A::Resend) => Ok(S::Scheduled),
        (S::Success, A::Resend) => Err(CoreError::conflict("event already sent")),
        (S::Scheduled | S::Processing | S::Retry | S::Discarded, A::Resend) => {
            Err(CoreError::conflict("cannot resend event that did not fail previously"))
        },

        // Force-resend bypasses the Failure-only guard, but a Processing
        // delivery is owned by a worker and cannot be pulled back.
        (S::Processing, A::ForceResend) => {
            Err(CoreError::conflict("cannot force resend a delivery that is being processed"))
        },
        (_, A::ForceResend) => Ok(S::Scheduled),

        (S::Scheduled | S::Retry, A::Cancel) => Ok(S::Discarded),
        (current, A::Cancel) => Err(CoreError::conflict(format!(
            "cannot discard a delivery in {current} status"
        ))),

        (current, action) => Err(CoreError::conflict(format!(
            "illegal delivery transition: {action:?} while {current}"
        ))),
    }
}

/// Outcome of a batch retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRetryOutcome {
    /// Deliveries successfully requeued.
    pub successes: u32,

    /// Deliveries rejected by their per-item guard.
    pub failures: u32,
}

/// Manual operator actions on deliveries.
pub struct ManualOps {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    health: Arc<HealthService>,
    clock: Arc<dyn Clock>,
}

impl ManualOps {
    /// Creates the manual-operations service.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        health: Arc<HealthService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, queue, health, clock }
    }

    /// Resends a failed delivery.
    ///
    /// Legal only when the delivery is in Failure. Resending to an Inactive
    /// endpoint first drives it to Pending and marks the requeued delivery
    /// as the single re-activation probe; resending to a Pending endpoint
    /// is rejected outright.
    ///
    /// # Errors
    ///
    /// - `NotFound` for a missing delivery or endpoint.
    /// - `Conflict("event already sent")` for Success deliveries.
    /// - `Conflict("cannot resend event that did not fail previously")` for
    ///   Scheduled/Processing/Retry deliveries.
    /// - `Conflict("endpoint is being re-activated")` for Pending endpoints.
    pub async fn resend(&self, delivery_id: DeliveryId) -> Result<()> {
        let delivery = self.require_delivery(delivery_id).await?;
        transition(delivery.status, DeliveryAction::Resend)?;

        let endpoint = self
            .storage
            .find_endpoint(delivery.endpoint_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("endpoint {} not found", delivery.endpoint_id))
            })?;

        let probe = match endpoint.status {
            EndpointStatus::Active => false,
            EndpointStatus::Inactive => {
                self.health.apply(endpoint.id, EndpointAction::BeginReactivation).await?;
                true
            },
            EndpointStatus::Pending => {
                return Err(CoreError::conflict("endpoint is being re-activated"));
            },
        };

        self.requeue(&delivery, &[DeliveryStatus::Failure], probe).await
    }

    /// Force-resends a delivery regardless of its status.
    ///
    /// The endpoint must be Active; Inactive and Pending endpoints are
    /// rejected with no probe side effect.
    ///
    /// # Errors
    ///
    /// - `NotFound` for a missing delivery or endpoint.
    /// - `Conflict("force resend to an inactive or pending endpoint is not
    ///   allowed")` for non-Active endpoints.
    pub async fn force_resend(&self, delivery_id: DeliveryId) -> Result<()> {
        let delivery = self.require_delivery(delivery_id).await?;
        transition(delivery.status, DeliveryAction::ForceResend)?;

        let endpoint = self
            .storage
            .find_endpoint(delivery.endpoint_id)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("endpoint {} not found", delivery.endpoint_id))
            })?;

        if endpoint.status != EndpointStatus::Active {
            return Err(CoreError::conflict(
                "force resend to an inactive or pending endpoint is not allowed",
            ));
        }

        self.requeue(
            &delivery,
            &[
                DeliveryStatus::Scheduled,
                DeliveryStatus::Success,
                DeliveryStatus::Retry,
                DeliveryStatus::Failure,
                DeliveryStatus::Discarded,
            ],
            false,
        )
        .await
    }

    /// Applies the resend rule independently to every delivery matching the
    /// filter.
    ///
    /// Per-item guard failures are accumulated, never raised; only a
    /// listing failure aborts the batch.
    ///
    /// # Errors
    ///
    /// Returns an error only when the underlying listing query fails.
    pub async fn batch_retry(&self, query: &DeliveryQuery) -> Result<BatchRetryOutcome> {
        let mut outcome = BatchRetryOutcome::default();
        let mut page = 0;

        loop {
            let deliveries = self.storage.list_deliveries(query, page, BATCH_PAGE_SIZE).await?;
            let page_len = deliveries.len();

            for delivery in deliveries {
                match self.resend(delivery.id).await {
                    Ok(()) => outcome.successes += 1,
                    Err(error) => {
                        debug!(delivery_id = %delivery.id, error = %error,
                            "batch retry item rejected");
                        outcome.failures += 1;
                    },
                }
            }

            if page_len < BATCH_PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }

        info!(
            successes = outcome.successes,
            failures = outcome.failures,
            "batch retry completed"
        );
        Ok(outcome)
    }

    /// Cancels a pending delivery, moving it to Discarded.
    ///
    /// Only Scheduled and Retry deliveries can be discarded; a worker that
    /// already claimed the delivery owns it and the cancellation loses the
    /// race.
    ///
    /// # Errors
    ///
    /// - `NotFound` for a missing delivery.
    /// - `Conflict` when the delivery is not in a cancellable status.
    pub async fn cancel(&self, delivery_id: DeliveryId) -> Result<()> {
        let delivery = self.require_delivery(delivery_id).await?;
        transition(delivery.status, DeliveryAction::Cancel)?;

        if self.storage.cancel_delivery(delivery_id).await? {
            info!(delivery_id = %delivery_id, "delivery discarded");
            Ok(())
        } else {
            Err(CoreError::conflict(format!(
                "delivery {delivery_id} was claimed concurrently and cannot be discarded"
            )))
        }
    }

    /// Requeues a delivery: CAS to Scheduled, then enqueue.
    ///
    /// On enqueue failure the status update is deliberately not rolled
    /// back: the delivery is left Scheduled and the due-delivery claim
    /// sweep recovers it.
    async fn requeue(
        &self,
        delivery: &EventDelivery,
        expected: &[DeliveryStatus],
        probe: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        let applied =
            self.storage.requeue_delivery(delivery.id, expected, now, probe).await?;
        if !applied {
            return Err(CoreError::conflict(format!(
                "delivery {} changed status concurrently, not requeued",
                delivery.id
            )));
        }

        if let Err(error) =
            self.queue.write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(delivery.id)).await
        {
            warn!(
                delivery_id = %delivery.id,
                error = %error,
                "queue write failed after requeue, leaving Scheduled for sweep"
            );
        }

        info!(delivery_id = %delivery.id, probe, "delivery requeued");
        Ok(())
    }

    async fn require_delivery(&self, delivery_id: DeliveryId) -> Result<EventDelivery> {
        self.storage
            .find_delivery(delivery_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("delivery {delivery_id} not found")))
    }
}
