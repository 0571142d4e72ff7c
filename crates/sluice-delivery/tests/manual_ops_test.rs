//! Integration tests for manual operator actions.
//!
//! Resend, force-resend, batch retry, and cancellation, including the
//! endpoint-side guards and the re-activation probe side effect.

use std::sync::Arc;

use anyhow::Result;
use sluice_core::{
    models::{DeliveryQuery, DeliveryStatus, EndpointStatus, EventDelivery, ProjectId},
    time::TestClock,
};
use sluice_delivery::{
    health::HealthService,
    queue::InMemoryQueue,
    status::ManualOps,
    storage::{mock::InMemoryDeliveryStorage, DeliveryStorage},
};
use sluice_testing::{DeliveryBuilder, EndpointBuilder, EventBuilder, SubscriptionBuilder};

struct OpsEnv {
    storage: Arc<InMemoryDeliveryStorage>,
    queue: Arc<InMemoryQueue>,
    ops: ManualOps,
    project_id: ProjectId,
}

fn env() -> OpsEnv {
    let storage = Arc::new(InMemoryDeliveryStorage::new());
    let queue = Arc::new(InMemoryQueue::new());
    let clock = Arc::new(TestClock::new());
    let dyn_storage = storage.clone() as Arc<dyn DeliveryStorage>;
    let health = Arc::new(HealthService::new(dyn_storage.clone()));
    let ops = ManualOps::new(dyn_storage, queue.clone(), health, clock);
    OpsEnv { storage, queue, ops, project_id: ProjectId::new() }
}

impl OpsEnv {
    /// Seeds endpoint + subscription + event + one delivery in `status`.
    async fn seed_delivery(
        &self,
        endpoint_status: EndpointStatus,
        delivery_status: DeliveryStatus,
    ) -> EventDelivery {
        let endpoint =
            EndpointBuilder::new().project(self.project_id).status(endpoint_status).build();
        let subscription =
            SubscriptionBuilder::new(endpoint.id).project(self.project_id).build();
        let event = EventBuilder::new().project(self.project_id).build();
        let delivery = DeliveryBuilder::for_target(&event, &subscription)
            .status(delivery_status)
            .build();

        self.storage.insert_endpoint(endpoint).await;
        self.storage.insert_subscription(subscription).await;
        self.storage.insert_event(event).await;
        self.storage.insert_delivery(delivery.clone()).await;
        delivery
    }
}

#[tokio::test]
async fn resend_requeues_a_failed_delivery() -> Result<()> {
    let env = env();
    let delivery = env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Failure).await;

    env.ops.resend(delivery.id).await?;

    let stored = env.storage.delivery(delivery.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    assert!(!stored.probe);
    assert_eq!(env.queue.written().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn resend_on_success_reports_event_already_sent() {
    let env = env();
    let delivery = env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Success).await;

    let err = env.ops.resend(delivery.id).await.unwrap_err();
    assert_eq!(err.to_string(), "event already sent");

    let stored = env.storage.delivery(delivery.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
}

#[tokio::test]
async fn resend_on_non_failed_statuses_is_rejected() {
    for status in
        [DeliveryStatus::Scheduled, DeliveryStatus::Processing, DeliveryStatus::Retry]
    {
        let env = env();
        let delivery = env.seed_delivery(EndpointStatus::Active, status).await;

        let err = env.ops.resend(delivery.id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot resend event that did not fail previously",
            "unexpected guard for {status}"
        );

        // Nothing changed and nothing was enqueued.
        let stored = env.storage.delivery(delivery.id).await.unwrap();
        assert_eq!(stored.status, status);
        assert!(env.queue.written().await.is_empty());
    }
}

#[tokio::test]
async fn resend_to_inactive_endpoint_schedules_a_probe() -> Result<()> {
    let env = env();
    let delivery = env.seed_delivery(EndpointStatus::Inactive, DeliveryStatus::Failure).await;

    env.ops.resend(delivery.id).await?;

    let endpoint = env.storage.endpoint(delivery.endpoint_id).await.unwrap();
    assert_eq!(endpoint.status, EndpointStatus::Pending);

    let stored = env.storage.delivery(delivery.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    assert!(stored.probe, "the requeued delivery doubles as the probe");
    Ok(())
}

#[tokio::test]
async fn resend_to_pending_endpoint_is_rejected() {
    let env = env();
    let delivery = env.seed_delivery(EndpointStatus::Pending, DeliveryStatus::Failure).await;

    let err = env.ops.resend(delivery.id).await.unwrap_err();
    assert_eq!(err.to_string(), "endpoint is being re-activated");
}

#[tokio::test]
async fn force_resend_acts_on_success_deliveries() -> Result<()> {
    let env = env();
    let delivery = env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Success).await;

    env.ops.force_resend(delivery.id).await?;

    let stored = env.storage.delivery(delivery.id).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    Ok(())
}

#[tokio::test]
async fn force_resend_requires_an_active_endpoint() {
    for endpoint_status in [EndpointStatus::Inactive, EndpointStatus::Pending] {
        let env = env();
        let delivery = env.seed_delivery(endpoint_status, DeliveryStatus::Success).await;

        let err = env.ops.force_resend(delivery.id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "force resend to an inactive or pending endpoint is not allowed"
        );

        // No probe side effect and no status change.
        let endpoint = env.storage.endpoint(delivery.endpoint_id).await.unwrap();
        assert_eq!(endpoint.status, endpoint_status);
        let stored = env.storage.delivery(delivery.id).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Success);
    }
}

#[tokio::test]
async fn batch_retry_accumulates_per_item_outcomes() -> Result<()> {
    let env = env();

    // Three resendable failures, two guarded items.
    for _ in 0..3 {
        env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Failure).await;
    }
    env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Success).await;
    env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Scheduled).await;

    let query = DeliveryQuery {
        project_id: Some(env.project_id),
        statuses: vec![
            DeliveryStatus::Failure,
            DeliveryStatus::Success,
            DeliveryStatus::Scheduled,
        ],
        ..DeliveryQuery::default()
    };

    let outcome = env.ops.batch_retry(&query).await?;

    assert_eq!(outcome.successes, 3);
    assert_eq!(outcome.failures, 2);
    Ok(())
}

#[tokio::test]
async fn batch_retry_with_an_empty_listing_reports_zero_counts() -> Result<()> {
    let env = env();

    let query = DeliveryQuery {
        project_id: Some(env.project_id),
        statuses: vec![DeliveryStatus::Failure],
        ..DeliveryQuery::default()
    };
    let outcome = env.ops.batch_retry(&query).await?;

    assert_eq!(outcome.successes, 0);
    assert_eq!(outcome.failures, 0);
    Ok(())
}

#[tokio::test]
async fn cancel_discards_pending_deliveries_only() -> Result<()> {
    let env = env();

    let scheduled = env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Scheduled).await;
    env.ops.cancel(scheduled.id).await?;
    assert_eq!(
        env.storage.delivery(scheduled.id).await.unwrap().status,
        DeliveryStatus::Discarded
    );

    let processing =
        env.seed_delivery(EndpointStatus::Active, DeliveryStatus::Processing).await;
    let err = env.ops.cancel(processing.id).await.unwrap_err();
    assert!(err.to_string().contains("cannot discard"));
    assert_eq!(
        env.storage.delivery(processing.id).await.unwrap().status,
        DeliveryStatus::Processing
    );
    Ok(())
}

#[tokio::test]
async fn toggling_endpoints_follows_the_health_machine() -> Result<()> {
    let env = env();
    let endpoint = EndpointBuilder::new().project(env.project_id).build();
    let endpoint_id = endpoint.id;
    env.storage.insert_endpoint(endpoint).await;

    let health = HealthService::new(env.storage.clone() as Arc<dyn DeliveryStorage>);

    assert_eq!(health.toggle(endpoint_id).await?, EndpointStatus::Inactive);
    assert_eq!(health.toggle(endpoint_id).await?, EndpointStatus::Active);

    // A pending endpoint rejects the toggle.
    let pending = EndpointBuilder::new()
        .project(env.project_id)
        .status(EndpointStatus::Pending)
        .build();
    let pending_id = pending.id;
    env.storage.insert_endpoint(pending).await;

    let err = health.toggle(pending_id).await.unwrap_err();
    assert_eq!(err.to_string(), "endpoint is in pending status");
    Ok(())
}
