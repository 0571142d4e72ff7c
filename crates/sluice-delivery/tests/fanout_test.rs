//! Integration tests for fanout resolution.
//!
//! Covers direct, owner, and broadcast addressing, endpoint deduplication,
//! the empty-set policies, and delivery creation plus queue handoff.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use sluice_core::{
    error::CoreError,
    models::{DeliveryStatus, EndpointId, FilterConfig, ProjectId},
    time::TestClock,
};
use sluice_delivery::{
    fanout::{AddressingMode, FanoutResolver},
    queue::InMemoryQueue,
    storage::{mock::InMemoryDeliveryStorage, DeliveryStorage},
};
use sluice_testing::{EndpointBuilder, EventBuilder, SubscriptionBuilder};

struct FanoutEnv {
    storage: Arc<InMemoryDeliveryStorage>,
    queue: Arc<InMemoryQueue>,
    resolver: FanoutResolver,
    project_id: ProjectId,
}

fn env() -> FanoutEnv {
    let storage = Arc::new(InMemoryDeliveryStorage::new());
    let queue = Arc::new(InMemoryQueue::new());
    let clock = Arc::new(TestClock::new());
    let resolver = FanoutResolver::new(
        storage.clone() as Arc<dyn DeliveryStorage>,
        queue.clone(),
        clock,
    );
    FanoutEnv { storage, queue, resolver, project_id: ProjectId::new() }
}

#[tokio::test]
async fn direct_fanout_creates_one_scheduled_delivery() -> Result<()> {
    let env = env();
    let endpoint = EndpointBuilder::new().project(env.project_id).build();
    let endpoint_id = endpoint.id;
    let subscription = SubscriptionBuilder::new(endpoint_id)
        .project(env.project_id)
        .event_types(&["*"])
        .build();
    env.storage.insert_endpoint(endpoint).await;
    env.storage.insert_subscription(subscription).await;

    let event = EventBuilder::new()
        .project(env.project_id)
        .event_type("payment.created")
        .build();
    env.storage.insert_event(event.clone()).await;

    let deliveries =
        env.resolver.fan_out(&event, &AddressingMode::Direct(endpoint_id)).await?;

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].endpoint_id, endpoint_id);
    assert_eq!(deliveries[0].status, DeliveryStatus::Scheduled);
    assert_eq!(deliveries[0].attempts, 0);

    // The delivery was persisted and one job was handed to the queue.
    let stored = env.storage.delivery(deliveries[0].id).await.expect("delivery persisted");
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    assert_eq!(env.queue.written().await.len(), 1);

    Ok(())
}

#[tokio::test]
async fn direct_fanout_to_unknown_endpoint_is_an_error() {
    let env = env();
    let event = EventBuilder::new().project(env.project_id).build();

    let err = env
        .resolver
        .resolve(&event, &AddressingMode::Direct(EndpointId::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::NotFound(_)));
    assert!(err.to_string().contains("no valid endpoint found"));
}

#[tokio::test]
async fn owner_fanout_resolves_every_endpoint_with_the_tag() -> Result<()> {
    let env = env();

    for _ in 0..3 {
        let endpoint =
            EndpointBuilder::new().project(env.project_id).owner("acct-42").build();
        let subscription =
            SubscriptionBuilder::new(endpoint.id).project(env.project_id).build();
        env.storage.insert_endpoint(endpoint).await;
        env.storage.insert_subscription(subscription).await;
    }
    // An endpoint with a different owner tag stays out of the set.
    let other = EndpointBuilder::new().project(env.project_id).owner("acct-7").build();
    let other_sub = SubscriptionBuilder::new(other.id).project(env.project_id).build();
    env.storage.insert_endpoint(other).await;
    env.storage.insert_subscription(other_sub).await;

    let event = EventBuilder::new().project(env.project_id).build();
    let targets =
        env.resolver.resolve(&event, &AddressingMode::Owner("acct-42".to_string())).await?;

    assert_eq!(targets.len(), 3);
    Ok(())
}

#[tokio::test]
async fn owner_fanout_with_no_matching_endpoints_is_an_error() {
    let env = env();
    let event = EventBuilder::new().project(env.project_id).build();

    let err = env
        .resolver
        .resolve(&event, &AddressingMode::Owner("nobody".to_string()))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no valid endpoint found"));
}

#[tokio::test]
async fn broadcast_keeps_only_matching_subscriptions() -> Result<()> {
    let env = env();

    let matching = EndpointBuilder::new().project(env.project_id).build();
    let matching_sub = SubscriptionBuilder::new(matching.id)
        .project(env.project_id)
        .event_types(&["invoice.paid"])
        .build();
    env.storage.insert_endpoint(matching).await;
    env.storage.insert_subscription(matching_sub).await;

    let filtered = EndpointBuilder::new().project(env.project_id).build();
    let filtered_sub = SubscriptionBuilder::new(filtered.id)
        .project(env.project_id)
        .event_types(&["payment.created"])
        .build();
    env.storage.insert_endpoint(filtered).await;
    env.storage.insert_subscription(filtered_sub).await;

    let body_filtered = EndpointBuilder::new().project(env.project_id).build();
    let body_filtered_sub = SubscriptionBuilder::new(body_filtered.id)
        .project(env.project_id)
        .filter(FilterConfig {
            event_types: vec!["*".to_string()],
            body: json!({"currency": "USD"}),
            headers: json!({}),
        })
        .build();
    env.storage.insert_endpoint(body_filtered).await;
    env.storage.insert_subscription(body_filtered_sub).await;

    let event = EventBuilder::new()
        .project(env.project_id)
        .event_type("invoice.paid")
        .json_payload(&json!({"currency": "EUR", "amount": 120}))
        .build();

    let targets = env.resolver.resolve(&event, &AddressingMode::Broadcast).await?;

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].subscription.filter.0.event_types, vec!["invoice.paid"]);
    Ok(())
}

#[tokio::test]
async fn broadcast_with_zero_matches_is_a_silent_no_op() -> Result<()> {
    let env = env();
    let event = EventBuilder::new().project(env.project_id).build();

    let deliveries = env.resolver.fan_out(&event, &AddressingMode::Broadcast).await?;

    assert!(deliveries.is_empty());
    assert!(env.queue.written().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn fanout_deduplicates_by_endpoint_identity() -> Result<()> {
    let env = env();

    let endpoint = EndpointBuilder::new().project(env.project_id).build();
    let endpoint_id = endpoint.id;
    env.storage.insert_endpoint(endpoint).await;
    // Two subscriptions routing to the same endpoint.
    for _ in 0..2 {
        let subscription =
            SubscriptionBuilder::new(endpoint_id).project(env.project_id).build();
        env.storage.insert_subscription(subscription).await;
    }

    let event = EventBuilder::new().project(env.project_id).build();
    env.storage.insert_event(event.clone()).await;

    let deliveries = env.resolver.fan_out(&event, &AddressingMode::Broadcast).await?;

    assert_eq!(deliveries.len(), 1, "targets must deduplicate by endpoint id");
    Ok(())
}

#[tokio::test]
async fn repeated_fanout_never_duplicates_the_event_endpoint_pair() -> Result<()> {
    let env = env();
    let endpoint = EndpointBuilder::new().project(env.project_id).build();
    let endpoint_id = endpoint.id;
    let subscription =
        SubscriptionBuilder::new(endpoint_id).project(env.project_id).build();
    env.storage.insert_endpoint(endpoint).await;
    env.storage.insert_subscription(subscription).await;

    let event = EventBuilder::new().project(env.project_id).build();
    env.storage.insert_event(event.clone()).await;

    let first = env.resolver.fan_out(&event, &AddressingMode::Direct(endpoint_id)).await?;
    let second = env.resolver.fan_out(&event, &AddressingMode::Direct(endpoint_id)).await?;

    assert_eq!(first.len(), 1);
    assert!(second.is_empty(), "second fanout finds the existing delivery");
    assert_eq!(env.storage.all_deliveries().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn queue_write_failure_leaves_the_delivery_scheduled() -> Result<()> {
    let env = env();
    let endpoint = EndpointBuilder::new().project(env.project_id).build();
    let endpoint_id = endpoint.id;
    let subscription =
        SubscriptionBuilder::new(endpoint_id).project(env.project_id).build();
    env.storage.insert_endpoint(endpoint).await;
    env.storage.insert_subscription(subscription).await;

    let event = EventBuilder::new().project(env.project_id).build();
    env.storage.insert_event(event.clone()).await;

    env.queue.inject_write_error("broker unavailable").await;

    // Fanout still succeeds: the delivery is created and stays Scheduled
    // for the claim sweep to pick up.
    let deliveries =
        env.resolver.fan_out(&event, &AddressingMode::Direct(endpoint_id)).await?;

    assert_eq!(deliveries.len(), 1);
    let stored = env.storage.delivery(deliveries[0].id).await.expect("delivery persisted");
    assert_eq!(stored.status, DeliveryStatus::Scheduled);
    assert!(env.queue.written().await.is_empty());
    Ok(())
}
