//! Repository for subscription operations.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EndpointId, ProjectId, Subscription, SubscriptionId},
};

const SUBSCRIPTION_COLUMNS: &str = "id, project_id, source_id, endpoint_id, filter, \
                                    delivery_mode, retry, rate_limit, transform, \
                                    created_at, updated_at";

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a new subscription.
    ///
    /// Filter well-formedness is validated here, before persistence, so a
    /// malformed predicate can never reach the evaluator.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed filters, or a database error
    /// if the insert fails.
    pub async fn create(&self, subscription: &Subscription) -> Result<SubscriptionId> {
        subscription.filter.0.validate()?;
        if let Some(rate_limit) = &subscription.rate_limit {
            rate_limit.0.validate()?;
        }

        let id = sqlx::query_scalar(
            r"
            INSERT INTO subscriptions (
                id, project_id, source_id, endpoint_id, filter, delivery_mode,
                retry, rate_limit, transform, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            ",
        )
        .bind(subscription.id.0)
        .bind(subscription.project_id.0)
        .bind(&subscription.source_id)
        .bind(subscription.endpoint_id.0)
        .bind(&subscription.filter)
        .bind(subscription.delivery_mode)
        .bind(&subscription.retry)
        .bind(&subscription.rate_limit)
        .bind(&subscription.transform)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(SubscriptionId(id))
    }

    /// Finds a subscription by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, subscription_id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscription)
    }

    /// Finds the subscription targeting an endpoint.
    ///
    /// Project policy allows at most one subscription per endpoint for
    /// direct addressing; the newest wins if data predates that policy.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_endpoint(&self, endpoint_id: EndpointId) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE endpoint_id = $1
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(endpoint_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscription)
    }

    /// Lists every subscription in a project, for broadcast fanout.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_project(&self, project_id: ProjectId) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE project_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(project_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscriptions)
    }
}
