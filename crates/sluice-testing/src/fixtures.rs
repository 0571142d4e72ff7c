//! Test data builders.
//!
//! Each builder produces a fully-populated domain entity with sensible
//! defaults; override only what the test cares about.

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use sluice_core::models::{
    DeliveryId, DeliveryMode, DeliveryResponse, DeliveryStatus, Endpoint, EndpointId,
    EndpointStatus, Event, EventDelivery, EventId, FilterConfig, ProjectId, RateLimitConfig,
    RetryConfig, Secret, Subscription, SubscriptionId, TransformConfig,
};

/// Builder for test events.
pub struct EventBuilder {
    project_id: ProjectId,
    event_type: String,
    headers: HashMap<String, String>,
    payload: Vec<u8>,
}

impl EventBuilder {
    /// Creates a builder with defaults.
    pub fn new() -> Self {
        Self {
            project_id: ProjectId::new(),
            event_type: "test.event".to_string(),
            headers: HashMap::new(),
            payload: br#"{"hello":"world"}"#.to_vec(),
        }
    }

    /// Sets the owning project.
    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.project_id = project_id;
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the payload from a JSON value.
    pub fn json_payload(mut self, value: &serde_json::Value) -> Self {
        self.payload = serde_json::to_vec(value).expect("payload serializes");
        self
    }

    /// Sets a raw payload.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Builds the event.
    pub fn build(self) -> Event {
        Event {
            id: EventId::new(),
            project_id: self.project_id,
            event_type: self.event_type,
            headers: sqlx::types::Json(self.headers),
            payload: self.payload,
            created_at: Utc::now(),
        }
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test endpoints.
pub struct EndpointBuilder {
    id: EndpointId,
    project_id: ProjectId,
    url: String,
    owner_id: Option<String>,
    secrets: Vec<Secret>,
    status: EndpointStatus,
    rate_limit: Option<RateLimitConfig>,
    timeout_secs: i32,
    advanced_signatures: bool,
}

impl EndpointBuilder {
    /// Creates a builder with defaults: Active, one valid secret.
    pub fn new() -> Self {
        Self {
            id: EndpointId::new(),
            project_id: ProjectId::new(),
            url: "https://example.com/hooks".to_string(),
            owner_id: None,
            secrets: vec![Secret::new("whsec_testsecret", Utc::now())],
            status: EndpointStatus::Active,
            rate_limit: None,
            timeout_secs: 30,
            advanced_signatures: false,
        }
    }

    /// Sets the endpoint id.
    pub fn id(mut self, id: EndpointId) -> Self {
        self.id = id;
        self
    }

    /// Sets the owning project.
    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.project_id = project_id;
        self
    }

    /// Sets the target URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the owner fanout tag.
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Sets the health status.
    pub fn status(mut self, status: EndpointStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets a per-endpoint rate limit.
    pub fn rate_limit(mut self, count: u32, duration: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig { count, duration });
        self
    }

    /// Enables versioned signature headers.
    pub fn advanced_signatures(mut self) -> Self {
        self.advanced_signatures = true;
        self
    }

    /// Sets the per-attempt dispatch timeout.
    pub fn timeout_secs(mut self, timeout_secs: i32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Builds the endpoint.
    pub fn build(self) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: self.id,
            project_id: self.project_id,
            url: self.url,
            owner_id: self.owner_id,
            secrets: sqlx::types::Json(self.secrets),
            status: self.status,
            rate_limit: self.rate_limit.map(sqlx::types::Json),
            timeout_secs: self.timeout_secs,
            advanced_signatures: self.advanced_signatures,
            signature_header: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test subscriptions.
pub struct SubscriptionBuilder {
    project_id: ProjectId,
    endpoint_id: EndpointId,
    filter: FilterConfig,
    delivery_mode: DeliveryMode,
    retry: Option<RetryConfig>,
    rate_limit: Option<RateLimitConfig>,
    transform: TransformConfig,
}

impl SubscriptionBuilder {
    /// Creates a builder with defaults: match-all filter, at-least-once.
    pub fn new(endpoint_id: EndpointId) -> Self {
        Self {
            project_id: ProjectId::new(),
            endpoint_id,
            filter: FilterConfig::match_all(),
            delivery_mode: DeliveryMode::AtLeastOnce,
            retry: None,
            rate_limit: None,
            transform: TransformConfig::None,
        }
    }

    /// Sets the owning project.
    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.project_id = project_id;
        self
    }

    /// Sets the filter configuration.
    pub fn filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// Restricts the filter to specific event types.
    pub fn event_types(mut self, event_types: &[&str]) -> Self {
        self.filter.event_types = event_types.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the delivery mode.
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets a per-subscription retry override.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets a per-subscription rate limit.
    pub fn rate_limit(mut self, count: u32, duration: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig { count, duration });
        self
    }

    /// Sets the transform reference.
    pub fn transform(mut self, transform: TransformConfig) -> Self {
        self.transform = transform;
        self
    }

    /// Builds the subscription.
    pub fn build(self) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: SubscriptionId::new(),
            project_id: self.project_id,
            source_id: None,
            endpoint_id: self.endpoint_id,
            filter: sqlx::types::Json(self.filter),
            delivery_mode: self.delivery_mode,
            retry: self.retry.map(sqlx::types::Json),
            rate_limit: self.rate_limit.map(sqlx::types::Json),
            transform: sqlx::types::Json(self.transform),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Builder for test deliveries.
pub struct DeliveryBuilder {
    project_id: ProjectId,
    event_id: EventId,
    endpoint_id: EndpointId,
    subscription_id: SubscriptionId,
    status: DeliveryStatus,
    attempts: i32,
    probe: bool,
}

impl DeliveryBuilder {
    /// Creates a builder with defaults: Scheduled, zero attempts.
    pub fn new(event_id: EventId, endpoint_id: EndpointId, subscription_id: SubscriptionId) -> Self {
        Self {
            project_id: ProjectId::new(),
            event_id,
            endpoint_id,
            subscription_id,
            status: DeliveryStatus::Scheduled,
            attempts: 0,
            probe: false,
        }
    }

    /// Creates a builder wired to an event/endpoint/subscription triple.
    pub fn for_target(event: &Event, subscription: &Subscription) -> Self {
        Self {
            project_id: event.project_id,
            event_id: event.id,
            endpoint_id: subscription.endpoint_id,
            subscription_id: subscription.id,
            status: DeliveryStatus::Scheduled,
            attempts: 0,
            probe: false,
        }
    }

    /// Sets the status.
    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the attempt counter.
    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Marks the delivery as a re-activation probe.
    pub fn probe(mut self) -> Self {
        self.probe = true;
        self
    }

    /// Builds the delivery.
    pub fn build(self) -> EventDelivery {
        let now = Utc::now();
        EventDelivery {
            id: DeliveryId::new(),
            project_id: self.project_id,
            event_id: self.event_id,
            endpoint_id: self.endpoint_id,
            subscription_id: self.subscription_id,
            status: self.status,
            attempts: self.attempts,
            next_attempt_at: Some(now),
            response: sqlx::types::Json(DeliveryResponse::default()),
            probe: self.probe,
            created_at: now,
            updated_at: now,
        }
    }
}
