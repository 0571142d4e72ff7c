//! PostgreSQL persistence layer.
//!
//! One repository per aggregate, bundled into [`Storage`] for injection into
//! services. All queries are runtime-bound; status changes are expressed as
//! conditional updates from an expected prior state so concurrent workers
//! never clobber each other.

pub mod deliveries;
pub mod endpoints;
pub mod events;
pub mod subscriptions;

use std::sync::Arc;

use sqlx::PgPool;

/// Bundle of all repositories sharing one connection pool.
pub struct Storage {
    /// Event repository.
    pub events: events::Repository,

    /// Endpoint repository.
    pub endpoints: endpoints::Repository,

    /// Subscription repository.
    pub subscriptions: subscriptions::Repository,

    /// Event-delivery repository.
    pub deliveries: deliveries::Repository,
}

impl Storage {
    /// Creates the repository bundle over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            events: events::Repository::new(pool.clone()),
            endpoints: endpoints::Repository::new(pool.clone()),
            subscriptions: subscriptions::Repository::new(pool.clone()),
            deliveries: deliveries::Repository::new(pool),
        }
    }
}
