//! Core domain models, filter evaluation, and persistence.
//!
//! Provides strongly-typed domain primitives, the pure subscription filter
//! evaluator, the error taxonomy, and PostgreSQL repositories for the sluice
//! delivery gateway. The delivery engine crate builds on these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod filter;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeliveryId, DeliveryMode, DeliveryStatus, Endpoint, EndpointId, EndpointStatus, Event,
    EventDelivery, EventId, FilterConfig, ProjectId, RateLimitConfig, RetryConfig, RetryStrategy,
    Subscription, SubscriptionId,
};
pub use time::{Clock, RealClock, TestClock};
