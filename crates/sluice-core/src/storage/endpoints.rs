//! Repository for endpoint operations.
//!
//! Endpoint status changes race between concurrent delivery outcomes, so
//! every status write here is a compare-and-set from an expected prior
//! state. Callers re-read and retry on conflict.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Endpoint, EndpointId, EndpointStatus, ProjectId},
};

const ENDPOINT_COLUMNS: &str = "id, project_id, url, owner_id, secrets, status, rate_limit, \
                                timeout_secs, advanced_signatures, signature_header, \
                                created_at, updated_at";

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Creates a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or constraints are violated.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO endpoints (
                id, project_id, url, owner_id, secrets, status, rate_limit,
                timeout_secs, advanced_signatures, signature_header,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            ",
        )
        .bind(endpoint.id.0)
        .bind(endpoint.project_id.0)
        .bind(&endpoint.url)
        .bind(&endpoint.owner_id)
        .bind(&endpoint.secrets)
        .bind(endpoint.status)
        .bind(&endpoint.rate_limit)
        .bind(endpoint.timeout_secs)
        .bind(endpoint.advanced_signatures)
        .bind(&endpoint.signature_header)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(EndpointId(id))
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = $1"
        ))
        .bind(endpoint_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Finds all endpoints in a project sharing an owner tag.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_owner(&self, project_id: ProjectId, owner_id: &str) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints
             WHERE project_id = $1 AND owner_id = $2
             ORDER BY created_at DESC"
        ))
        .bind(project_id.0)
        .bind(owner_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Conditionally updates an endpoint's status.
    ///
    /// Returns `true` when the endpoint was in `expected` status and the
    /// transition was applied, `false` when a concurrent writer got there
    /// first. Callers re-read and re-derive the transition on `false`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_status(
        &self,
        endpoint_id: EndpointId,
        expected: EndpointStatus,
        new: EndpointStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE endpoints
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            ",
        )
        .bind(endpoint_id.0)
        .bind(expected)
        .bind(new)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Replaces an endpoint's secret set after rotation.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_secrets(&self, endpoint: &Endpoint) -> Result<()> {
        sqlx::query(
            r"
            UPDATE endpoints
            SET secrets = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint.id.0)
        .bind(&endpoint.secrets)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
