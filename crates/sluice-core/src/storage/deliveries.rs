//! Repository for event-delivery operations.
//!
//! Deliveries are the contended table: multiple workers claim and update
//! them concurrently, and the queue may redeliver a job that is already in
//! flight. Claiming uses `FOR UPDATE SKIP LOCKED`; every lifecycle write is
//! a compare-and-set from the expected prior status and reports whether it
//! won the race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};

use crate::{
    error::Result,
    models::{
        DeliveryId, DeliveryQuery, DeliveryResponse, DeliveryStatus, EndpointId, EventDelivery,
        EventId,
    },
};

const DELIVERY_COLUMNS: &str = "id, project_id, event_id, endpoint_id, subscription_id, status, \
                                attempts, next_attempt_at, response, probe, created_at, updated_at";

/// Repository for event-delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a new delivery record.
    ///
    /// A unique index on (event_id, endpoint_id) enforces the
    /// one-delivery-per-pair invariant; violating it surfaces as a
    /// constraint error.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, delivery: &EventDelivery) -> Result<DeliveryId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO event_deliveries (
                id, project_id, event_id, endpoint_id, subscription_id, status,
                attempts, next_attempt_at, response, probe, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            ",
        )
        .bind(delivery.id.0)
        .bind(delivery.project_id.0)
        .bind(delivery.event_id.0)
        .bind(delivery.endpoint_id.0)
        .bind(delivery.subscription_id.0)
        .bind(delivery.status)
        .bind(delivery.attempts)
        .bind(delivery.next_attempt_at)
        .bind(&delivery.response)
        .bind(delivery.probe)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(DeliveryId(id))
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, delivery_id: DeliveryId) -> Result<Option<EventDelivery>> {
        let delivery = sqlx::query_as::<_, EventDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries WHERE id = $1"
        ))
        .bind(delivery_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Finds the delivery for one (event, endpoint) pair.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event_and_endpoint(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
    ) -> Result<Option<EventDelivery>> {
        let delivery = sqlx::query_as::<_, EventDelivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries
             WHERE event_id = $1 AND endpoint_id = $2"
        ))
        .bind(event_id.0)
        .bind(endpoint_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Claims a batch of due deliveries for processing.
    ///
    /// Selects Scheduled/Retry deliveries whose `next_attempt_at` has
    /// passed, using `FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// contend, and flips them to Processing in the same statement. A job
    /// redelivered by the queue finds its row already Processing (or
    /// locked) and claims nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_due(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventDelivery>> {
        let deliveries = sqlx::query_as::<_, EventDelivery>(&format!(
            r"
            UPDATE event_deliveries
            SET status = 'processing', updated_at = $1
            WHERE id IN (
                SELECT id FROM event_deliveries
                WHERE status IN ('scheduled', 'retry')
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
                ORDER BY next_attempt_at ASC NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {DELIVERY_COLUMNS}
            "
        ))
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Records a successful attempt: Processing -> Success.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_success(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.finish_attempt(delivery_id, DeliveryStatus::Success, attempts, None, response).await
    }

    /// Records a retryable failure: Processing -> Retry with a schedule.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_retry(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.finish_attempt(
            delivery_id,
            DeliveryStatus::Retry,
            attempts,
            Some(next_attempt_at),
            response,
        )
        .await
    }

    /// Records a terminal failure: Processing -> Failure.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_failure(
        &self,
        delivery_id: DeliveryId,
        attempts: i32,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        self.finish_attempt(delivery_id, DeliveryStatus::Failure, attempts, None, response).await
    }

    async fn finish_attempt(
        &self,
        delivery_id: DeliveryId,
        new_status: DeliveryStatus,
        attempts: i32,
        next_attempt_at: Option<DateTime<Utc>>,
        response: &DeliveryResponse,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = $2, attempts = $3, next_attempt_at = $4, response = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(delivery_id.0)
        .bind(new_status)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(sqlx::types::Json(response))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Defers a rate-limited delivery: Processing -> Scheduled.
    ///
    /// The attempt counter is untouched; a deferral is not an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn defer(
        &self,
        delivery_id: DeliveryId,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = 'scheduled', next_attempt_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(delivery_id.0)
        .bind(next_attempt_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Requeues a delivery: `expected` -> Scheduled, due immediately.
    ///
    /// Used by resend and force-resend; `probe` marks the requeued delivery
    /// as an endpoint re-activation probe.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue(
        &self,
        delivery_id: DeliveryId,
        expected: &[DeliveryStatus],
        now: DateTime<Utc>,
        probe: bool,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
        let result = sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = 'scheduled', next_attempt_at = $3, probe = $4, updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            ",
        )
        .bind(delivery_id.0)
        .bind(&expected)
        .bind(now)
        .bind(probe)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancels a pending delivery: Scheduled/Retry -> Discarded.
    ///
    /// A Processing delivery is owned by a worker and cannot be cancelled;
    /// the CAS simply misses and this returns `false`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn cancel(&self, delivery_id: DeliveryId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE event_deliveries
            SET status = 'discarded', next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'retry')
            ",
        )
        .bind(delivery_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Paged, filtered delivery listing for batch retry and operator tooling.
    ///
    /// `page` is zero-based. Results are ordered newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(
        &self,
        query: &DeliveryQuery,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<EventDelivery>> {
        let mut builder: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {DELIVERY_COLUMNS} FROM event_deliveries WHERE TRUE"
        ));

        if let Some(project_id) = query.project_id {
            builder.push(" AND project_id = ").push_bind(project_id.0);
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> = query.statuses.iter().map(ToString::to_string).collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if !query.endpoint_ids.is_empty() {
            let ids: Vec<uuid::Uuid> = query.endpoint_ids.iter().map(|id| id.0).collect();
            builder.push(" AND endpoint_id = ANY(").push_bind(ids).push(")");
        }
        if let Some(since) = query.since {
            builder.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            builder.push(" AND created_at < ").push_bind(until);
        }

        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(per_page))
            .push(" OFFSET ")
            .push_bind(i64::from(page) * i64::from(per_page));

        let deliveries = builder.build_query_as::<EventDelivery>().fetch_all(&*self.pool).await?;

        Ok(deliveries)
    }
}
