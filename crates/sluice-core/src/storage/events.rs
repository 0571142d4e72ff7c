//! Repository for event operations.
//!
//! Events are immutable once created; this repository only inserts and
//! reads.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Event, EventId},
};

/// Repository for event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a new event.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, event: &Event) -> Result<EventId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO events (id, project_id, event_type, headers, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(event.id.0)
        .bind(event.project_id.0)
        .bind(&event.event_type)
        .bind(&event.headers)
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(EventId(id))
    }

    /// Finds an event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            r"
            SELECT id, project_id, event_type, headers, payload, created_at
            FROM events
            WHERE id = $1
            ",
        )
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}
