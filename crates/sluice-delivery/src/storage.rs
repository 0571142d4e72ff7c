//! Storage abstraction for the delivery engine.
//!
//! Trait boundary over the persistence operations the engine needs, with a
//! production PostgreSQL implementation wrapping
//! `sluice_core::storage::Storage` and an in-memory mock for deterministic
//! tests. Every status write is conditional on the expected prior state and
//! reports whether it won the race.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{
    error::Result,
    models::{
        DeliveryId, DeliveryQuery, DeliveryResponse, DeliveryStatus, Endpoint, EndpointId,
        EndpointStatus, Event, EventDelivery, EventId, ProjectId, Subscription, SubscriptionId,
    },
    storage::Storage,
};

/// Persistence operations required by the delivery engine.
#[async_trait]
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds an event by ID.
    async fn find_event(&self, event_id: EventId) -> Result<Option<Event>>;

    /// Persists a delivery created by fanout.
    async fn create_delivery(&self, delivery: &EventDelivery) -> Result<()>;

    /// Finds a delivery by ID.
    async fn find_delivery(&self, delivery_id: DeliveryId) -> Result<Option<EventDelivery>>;

    /// Claims due Scheduled/Retry deliveries, flipping them to Processing.
    ///
    /// This is the per-delivery mutual exclusion point: a queue redelivery
    /// for a claimed row claims nothing.
    async fn claim_due(&self, batch_size: usize, now: DateTime<Utc>)
        -> Result<Vec<EventDelivery>>;

    /// Processing -> Success with final response metadata.
    async fn record_success(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool>;

    /// Processing -> Retry with the next attempt schedule.
    async fn record_retry(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        response: &DeliveryResponse,
    ) -> Result<bool>;

    /// Processing -> Failure with final response metadata.
    async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool>;

    /// Processing -> Scheduled without counting an attempt (rate-limit
    /// deferral).
    async fn defer_delivery(
        &self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// CAS from one of `expected` -> Scheduled, due immediately.
    async fn requeue_delivery(
        &self,
        delivery_id: DeliveryId,
        expected: &[DeliveryStatus],
        now: DateTime<Utc>,
        probe: bool,
    ) -> Result<bool>;

    /// Scheduled/Retry -> Discarded.
    async fn cancel_delivery(&self, delivery_id: DeliveryId) -> Result<bool>;

    /// Paged, filtered delivery listing.
    async fn list_deliveries(
        &self,
        query: &DeliveryQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<EventDelivery>>;

    /// Finds an endpoint by ID.
    async fn find_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>>;

    /// Finds all endpoints in a project sharing an owner tag.
    async fn find_endpoints_by_owner(
        &self,
        project_id: ProjectId,
        owner_id: &str,
    ) -> Result<Vec<Endpoint>>;

    /// CAS on endpoint status; `true` when the transition was applied.
    async fn update_endpoint_status(
        &self,
        endpoint_id: EndpointId,
        expected: EndpointStatus,
        new: EndpointStatus,
    ) -> Result<bool>;

    /// Finds a subscription by ID.
    async fn find_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>>;

    /// Finds the subscription targeting an endpoint.
    async fn find_subscription_by_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Option<Subscription>>;

    /// Lists every subscription in a project, for broadcast fanout.
    async fn list_subscriptions(&self, project_id: ProjectId) -> Result<Vec<Subscription>>;
}

/// Production storage implementation over PostgreSQL repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryStorage for PostgresDeliveryStorage {
    async fn find_event(&self, event_id: EventId) -> Result<Option<Event>> {
        self.storage.events.find_by_id(event_id).await
    }

    async fn create_delivery(&self, delivery: &EventDelivery) -> Result<()> {
        self.storage.deliveries.create(delivery).await.map(|_| ())
    }

    async fn find_delivery(&self, delivery_id: DeliveryId) -> Result<Option<EventDelivery>> {
        self.storage.deliveries.find_by_id(delivery_id).await
    }

    async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventDelivery>> {
        self.storage.deliveries.claim_due(batch_size, now).await
    }

    async fn record_success(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.storage.deliveries.record_success(delivery_id, attempts, response).await
    }

    async fn record_retry(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.storage.deliveries.record_retry(delivery_id, attempts, next_attempt_at, response).await
    }

    async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.storage.deliveries.record_failure(delivery_id, attempts, response).await
    }

    async fn defer_delivery(
        &self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.storage.deliveries.defer(delivery_id, next_attempt_at).await
    }

    async fn requeue_delivery(
        &self,
        delivery_id: DeliveryId,
        expected: &[DeliveryStatus],
        now: DateTime<Utc>,
        probe: bool,
    ) -> Result<bool> {
        self.storage.deliveries.requeue(delivery_id, expected, now, probe).await
    }

    async fn cancel_delivery(&self, delivery_id: DeliveryId) -> Result<bool> {
        self.storage.deliveries.cancel(delivery_id).await
    }

    async fn list_deliveries(
        &self,
        query: &DeliveryQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<EventDelivery>> {
        self.storage.deliveries.list(query, page, per_page).await
    }

    async fn find_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        self.storage.endpoints.find_by_id(endpoint_id).await
    }

    async fn find_endpoints_by_owner(
        &self,
        project_id: ProjectId,
        owner_id: &str,
    ) -> Result<Vec<Endpoint>> {
        self.storage.endpoints.find_by_owner(project_id, owner_id).await
    }

    async fn update_endpoint_status(
        &self,
        endpoint_id: EndpointId,
        expected: EndpointStatus,
        new: EndpointStatus,
    ) -> Result<bool> {
        self.storage.endpoints.update_status(endpoint_id, expected, new).await
    }

    async fn find_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.storage.subscriptions.find_by_id(subscription_id).await
    }

    async fn find_subscription_by_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Result<Option<Subscription>> {
        self.storage.subscriptions.find_by_endpoint(endpoint_id).await
    }

    async fn list_subscriptions(&self, project_id: ProjectId) -> Result<Vec<Subscription>> {
        self.storage.subscriptions.find_by_project(project_id).await
    }
}

pub mod mock {
    //! In-memory storage for deterministic tests.
    //!
    //! Implements the same conditional-update semantics as the PostgreSQL
    //! repositories so the engine's race handling is exercised for real.

    use std::collections::HashMap;

    use sluice_core::error::CoreError;
    use tokio::sync::RwLock;

    use super::{
        async_trait, DateTime, DeliveryId, DeliveryQuery, DeliveryResponse, DeliveryStatus,
        DeliveryStorage, Endpoint, EndpointId, EndpointStatus, Event, EventDelivery, EventId,
        ProjectId, Result, Subscription, SubscriptionId, Utc,
    };

    /// In-memory [`DeliveryStorage`] implementation.
    #[derive(Default)]
    pub struct InMemoryDeliveryStorage {
        events: RwLock<HashMap<EventId, Event>>,
        endpoints: RwLock<HashMap<EndpointId, Endpoint>>,
        subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
        deliveries: RwLock<HashMap<DeliveryId, EventDelivery>>,
    }

    impl InMemoryDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds an event.
        pub async fn insert_event(&self, event: Event) {
            self.events.write().await.insert(event.id, event);
        }

        /// Seeds an endpoint.
        pub async fn insert_endpoint(&self, endpoint: Endpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Seeds a subscription.
        pub async fn insert_subscription(&self, subscription: Subscription) {
            self.subscriptions.write().await.insert(subscription.id, subscription);
        }

        /// Seeds a delivery.
        pub async fn insert_delivery(&self, delivery: EventDelivery) {
            self.deliveries.write().await.insert(delivery.id, delivery);
        }

        /// Snapshot of a delivery for assertions.
        pub async fn delivery(&self, delivery_id: DeliveryId) -> Option<EventDelivery> {
            self.deliveries.read().await.get(&delivery_id).cloned()
        }

        /// Snapshot of an endpoint for assertions.
        pub async fn endpoint(&self, endpoint_id: EndpointId) -> Option<Endpoint> {
            self.endpoints.read().await.get(&endpoint_id).cloned()
        }

        /// All deliveries, for assertions on fanout results.
        pub async fn all_deliveries(&self) -> Vec<EventDelivery> {
            self.deliveries.read().await.values().cloned().collect()
        }

        async fn transition_delivery<F>(
            &self,
            delivery_id: DeliveryId,
            expected: &[DeliveryStatus],
            apply: F,
        ) -> Result<bool>
        where
            F: FnOnce(&mut EventDelivery),
        {
            let mut deliveries = self.deliveries.write().await;
            let Some(delivery) = deliveries.get_mut(&delivery_id) else {
                return Ok(false);
            };
            if !expected.contains(&delivery.status) {
                return Ok(false);
            }
            apply(delivery);
            delivery.updated_at = Utc::now();
            Ok(true)
        }
    }

    #[async_trait]
    impl DeliveryStorage for InMemoryDeliveryStorage {
        async fn find_event(&self, event_id: EventId) -> Result<Option<Event>> {
            Ok(self.events.read().await.get(&event_id).cloned())
        }

        async fn create_delivery(&self, delivery: &EventDelivery) -> Result<()> {
            let mut deliveries = self.deliveries.write().await;
            let duplicate = deliveries.values().any(|d| {
                d.event_id == delivery.event_id && d.endpoint_id == delivery.endpoint_id
            });
            if duplicate {
                return Err(CoreError::Constraint(format!(
                    "delivery already exists for event {} endpoint {}",
                    delivery.event_id, delivery.endpoint_id
                )));
            }
            deliveries.insert(delivery.id, delivery.clone());
            Ok(())
        }

        async fn find_delivery(&self, delivery_id: DeliveryId) -> Result<Option<EventDelivery>> {
            Ok(self.deliveries.read().await.get(&delivery_id).cloned())
        }

        async fn claim_due(
            &self,
            batch_size: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<EventDelivery>> {
            let mut deliveries = self.deliveries.write().await;
            let mut due: Vec<(Option<DateTime<Utc>>, DeliveryId)> = deliveries
                .values()
                .filter(|d| {
                    matches!(d.status, DeliveryStatus::Scheduled | DeliveryStatus::Retry)
                        && d.next_attempt_at.is_none_or(|at| at <= now)
                })
                .map(|d| (d.next_attempt_at, d.id))
                .collect();
            due.sort_by(|a, b| a.0.cmp(&b.0).then(a.1 .0.cmp(&b.1 .0)));
            due.truncate(batch_size);

            let mut claimed = Vec::with_capacity(due.len());
            for (_, id) in due {
                if let Some(delivery) = deliveries.get_mut(&id) {
                    delivery.status = DeliveryStatus::Processing;
                    delivery.updated_at = now;
                    claimed.push(delivery.clone());
                }
            }
            Ok(claimed)
        }

        async fn record_success(
            &self,
            delivery_id: DeliveryId,
            attempts: i32,
            response: &DeliveryResponse,
        ) -> Result<bool> {
            let response = response.clone();
            self.transition_delivery(delivery_id, &[DeliveryStatus::Processing], move |d| {
                d.status = DeliveryStatus::Success;
                d.attempts = attempts;
                d.next_attempt_at = None;
                d.response = sqlx::types::Json(response);
            })
            .await
        }

        async fn record_retry(
            &self,
            delivery_id: DeliveryId,
            attempts: i32,
            next_attempt_at: DateTime<Utc>,
            response: &DeliveryResponse,
        ) -> Result<bool> {
            let response = response.clone();
            self.transition_delivery(delivery_id, &[DeliveryStatus::Processing], move |d| {
                d.status = DeliveryStatus::Retry;
                d.attempts = attempts;
                d.next_attempt_at = Some(next_attempt_at);
                d.response = sqlx::types::Json(response);
            })
            .await
        }

        async fn record_failure(
            &self,
            delivery_id: DeliveryId,
            attempts: i32,
            response: &DeliveryResponse,
        ) -> Result<bool> {
            let response = response.clone();
            self.transition_delivery(delivery_id, &[DeliveryStatus::Processing], move |d| {
                d.status = DeliveryStatus::Failure;
                d.attempts = attempts;
                d.next_attempt_at = None;
                d.response = sqlx::types::Json(response);
            })
            .await
        }

        async fn defer_delivery(
            &self,
            delivery_id: DeliveryId,
            next_attempt_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.transition_delivery(delivery_id, &[DeliveryStatus::Processing], move |d| {
                d.status = DeliveryStatus::Scheduled;
                d.next_attempt_at = Some(next_attempt_at);
            })
            .await
        }

        async fn requeue_delivery(
            &self,
            delivery_id: DeliveryId,
            expected: &[DeliveryStatus],
            now: DateTime<Utc>,
            probe: bool,
        ) -> Result<bool> {
            self.transition_delivery(delivery_id, expected, move |d| {
                d.status = DeliveryStatus::Scheduled;
                d.next_attempt_at = Some(now);
                d.probe = probe;
            })
            .await
        }

        async fn cancel_delivery(&self, delivery_id: DeliveryId) -> Result<bool> {
            self.transition_delivery(
                delivery_id,
                &[DeliveryStatus::Scheduled, DeliveryStatus::Retry],
                |d| {
                    d.status = DeliveryStatus::Discarded;
                    d.next_attempt_at = None;
                },
            )
            .await
        }

        async fn list_deliveries(
            &self,
            query: &DeliveryQuery,
            page: u32,
            per_page: u32,
        ) -> Result<Vec<EventDelivery>> {
            let deliveries = self.deliveries.read().await;
            let mut matching: Vec<EventDelivery> = deliveries
                .values()
                .filter(|d| query.project_id.is_none_or(|p| d.project_id == p))
                .filter(|d| query.statuses.is_empty() || query.statuses.contains(&d.status))
                .filter(|d| {
                    query.endpoint_ids.is_empty() || query.endpoint_ids.contains(&d.endpoint_id)
                })
                .filter(|d| query.since.is_none_or(|s| d.created_at >= s))
                .filter(|d| query.until.is_none_or(|u| d.created_at < u))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.0.cmp(&b.id.0)));

            let start = (page as usize) * (per_page as usize);
            Ok(matching.into_iter().skip(start).take(per_page as usize).collect())
        }

        async fn find_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
            Ok(self.endpoints.read().await.get(&endpoint_id).cloned())
        }

        async fn find_endpoints_by_owner(
            &self,
            project_id: ProjectId,
            owner_id: &str,
        ) -> Result<Vec<Endpoint>> {
            Ok(self
                .endpoints
                .read()
                .await
                .values()
                .filter(|e| e.project_id == project_id)
                .filter(|e| e.owner_id.as_deref() == Some(owner_id))
                .cloned()
                .collect())
        }

        async fn update_endpoint_status(
            &self,
            endpoint_id: EndpointId,
            expected: EndpointStatus,
            new: EndpointStatus,
        ) -> Result<bool> {
            let mut endpoints = self.endpoints.write().await;
            let Some(endpoint) = endpoints.get_mut(&endpoint_id) else {
                return Ok(false);
            };
            if endpoint.status != expected {
                return Ok(false);
            }
            endpoint.status = new;
            endpoint.updated_at = Utc::now();
            Ok(true)
        }

        async fn find_subscription(
            &self,
            subscription_id: SubscriptionId,
        ) -> Result<Option<Subscription>> {
            Ok(self.subscriptions.read().await.get(&subscription_id).cloned())
        }

        async fn find_subscription_by_endpoint(
            &self,
            endpoint_id: EndpointId,
        ) -> Result<Option<Subscription>> {
            let subscriptions = self.subscriptions.read().await;
            let mut matching: Vec<&Subscription> =
                subscriptions.values().filter(|s| s.endpoint_id == endpoint_id).collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(matching.first().map(|s| (*s).clone()))
        }

        async fn list_subscriptions(&self, project_id: ProjectId) -> Result<Vec<Subscription>> {
            let subscriptions = self.subscriptions.read().await;
            let mut matching: Vec<Subscription> =
                subscriptions.values().filter(|s| s.project_id == project_id).cloned().collect();
            matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(matching)
        }
    }
}
