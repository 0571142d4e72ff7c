//! Fanout resolution.
//!
//! Maps an inbound event to the set of (endpoint, subscription) targets that
//! should receive it, creates one Scheduled delivery per target, and hands
//! each delivery to the queue. Targets are deduplicated by endpoint
//! identity.

use std::{collections::HashSet, sync::Arc};

use sluice_core::{
    error::{CoreError, Result},
    filter,
    models::{Endpoint, EndpointId, Event, EventDelivery, Subscription},
    time::Clock,
};
use tracing::{debug, warn};

use crate::{
    queue::{Job, TaskQueue, QUEUE_DELIVERIES, TASK_DISPATCH},
    storage::DeliveryStorage,
};

/// How the event names its destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressingMode {
    /// A single explicit endpoint (API-submitted events).
    Direct(EndpointId),

    /// Every endpoint sharing a tenant-supplied owner tag.
    Owner(String),

    /// Every subscription in the project whose filter matches.
    Broadcast,
}

/// One resolved fanout target.
///
/// A transient read-time join; the subscription itself stores only the
/// endpoint identifier.
#[derive(Debug, Clone)]
pub struct FanoutTarget {
    /// Destination endpoint.
    pub endpoint: Endpoint,

    /// Subscription that routed the event there.
    pub subscription: Subscription,
}

/// Resolves fanout targets and creates deliveries.
pub struct FanoutResolver {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl FanoutResolver {
    /// Creates a resolver over the given collaborators.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, queue, clock }
    }

    /// Resolves the target set for an event, deduplicated by endpoint.
    ///
    /// Direct and Owner addressing name destinations that must exist, so an
    /// empty result is an error. A broadcast that matches nobody is a
    /// silent no-op: subscribers are inherently optional.
    ///
    /// # Errors
    ///
    /// Returns `NotFound("no valid endpoint found")` for empty Direct/Owner
    /// resolution, or a storage error.
    pub async fn resolve(
        &self,
        event: &Event,
        addressing: &AddressingMode,
    ) -> Result<Vec<FanoutTarget>> {
        let mut targets = match addressing {
            AddressingMode::Direct(endpoint_id) => self.resolve_direct(*endpoint_id).await?,
            AddressingMode::Owner(owner_id) => self.resolve_owner(event, owner_id).await?,
            AddressingMode::Broadcast => self.resolve_broadcast(event).await?,
        };

        let mut seen: HashSet<EndpointId> = HashSet::new();
        targets.retain(|target| seen.insert(target.endpoint.id));

        if targets.is_empty() && !matches!(addressing, AddressingMode::Broadcast) {
            return Err(CoreError::not_found("no valid endpoint found"));
        }

        debug!(
            event_id = %event.id,
            target_count = targets.len(),
            ?addressing,
            "fanout resolved"
        );

        Ok(targets)
    }

    /// Resolves targets and creates one Scheduled delivery per target.
    ///
    /// Each created delivery is handed to the queue. A queue-write failure
    /// is logged and the delivery is left Scheduled for the due-delivery
    /// claim sweep to recover; the status update is never rolled back.
    ///
    /// # Errors
    ///
    /// Returns resolution errors and storage errors. Queue-write failures
    /// are not errors.
    pub async fn fan_out(
        &self,
        event: &Event,
        addressing: &AddressingMode,
    ) -> Result<Vec<EventDelivery>> {
        let targets = self.resolve(event, addressing).await?;
        let now = self.clock.now();

        let mut deliveries = Vec::with_capacity(targets.len());
        for target in targets {
            let delivery = EventDelivery::new(event, &target.subscription, now);

            match self.storage.create_delivery(&delivery).await {
                Ok(()) => {},
                Err(CoreError::Constraint(message)) => {
                    // One delivery per (event, endpoint): a duplicate means
                    // fanout already ran for this pair.
                    debug!(event_id = %event.id, endpoint_id = %target.endpoint.id, %message,
                        "skipping duplicate fanout target");
                    continue;
                },
                Err(error) => return Err(error),
            }

            if let Err(error) =
                self.queue.write(TASK_DISPATCH, QUEUE_DELIVERIES, Job::new(delivery.id)).await
            {
                warn!(
                    delivery_id = %delivery.id,
                    error = %error,
                    "queue write failed after delivery creation, leaving Scheduled for sweep"
                );
            }

            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    async fn resolve_direct(&self, endpoint_id: EndpointId) -> Result<Vec<FanoutTarget>> {
        let Some(endpoint) = self.storage.find_endpoint(endpoint_id).await? else {
            return Ok(Vec::new());
        };
        let Some(subscription) = self.storage.find_subscription_by_endpoint(endpoint_id).await?
        else {
            return Ok(Vec::new());
        };
        Ok(vec![FanoutTarget { endpoint, subscription }])
    }

    async fn resolve_owner(&self, event: &Event, owner_id: &str) -> Result<Vec<FanoutTarget>> {
        let endpoints =
            self.storage.find_endpoints_by_owner(event.project_id, owner_id).await?;

        let mut targets = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let Some(subscription) =
                self.storage.find_subscription_by_endpoint(endpoint.id).await?
            else {
                debug!(endpoint_id = %endpoint.id, "owner endpoint has no subscription, skipping");
                continue;
            };
            targets.push(FanoutTarget { endpoint, subscription });
        }
        Ok(targets)
    }

    async fn resolve_broadcast(&self, event: &Event) -> Result<Vec<FanoutTarget>> {
        let subscriptions = self.storage.list_subscriptions(event.project_id).await?;

        let mut targets = Vec::new();
        for subscription in subscriptions {
            if !filter::matches(event, &subscription.filter.0) {
                continue;
            }
            let Some(endpoint) = self.storage.find_endpoint(subscription.endpoint_id).await?
            else {
                warn!(
                    subscription_id = %subscription.id,
                    endpoint_id = %subscription.endpoint_id,
                    "subscription references missing endpoint, skipping"
                );
                continue;
            };
            targets.push(FanoutTarget { endpoint, subscription });
        }
        Ok(targets)
    }
}
