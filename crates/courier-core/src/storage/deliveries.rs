//! Repository for delivery records.
//!
//! Status changes are conditional updates: the `WHERE status = ANY(...)`
//! clause carries the state machine, so two writers racing on the same
//! delivery cannot move it backwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Delivery, DeliveryId, DeliveryStatus, StatusUpdate, SubscriptionId},
};

const DELIVERY_COLUMNS: &str = "id, subscription_id, event, payload, status, attempts, \
                                status_code, response, error, created_at, updated_at, delivered_at";

/// Repository for delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or violates a constraint.
    pub async fn create(&self, delivery: &Delivery) -> Result<DeliveryId> {
        self.create_impl(&*self.pool, delivery).await
    }

    /// Inserts a new delivery within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        delivery: &Delivery,
    ) -> Result<DeliveryId> {
        self.create_impl(&mut **tx, delivery).await
    }

    async fn create_impl<'e, E>(&self, executor: E, delivery: &Delivery) -> Result<DeliveryId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO deliveries (
                id, subscription_id, event, payload, status, attempts,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.subscription_id)
        .bind(&delivery.event)
        .bind(&delivery.payload)
        .bind(delivery.status.to_string())
        .bind(delivery.attempts)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Finds a delivery by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Applies a status update if the stored status permits it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown id and
    /// `CoreError::InvalidTransition` when the stored status does not allow
    /// the move.
    pub async fn update_status(&self, id: DeliveryId, update: &StatusUpdate) -> Result<Delivery> {
        let predecessors: Vec<String> = DeliveryStatus::predecessors(update.status)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let outcome = update.outcome.as_ref();

        let updated = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            UPDATE deliveries
            SET status = $2,
                attempts = COALESCE($3, attempts),
                status_code = CASE WHEN $4 THEN $5 ELSE status_code END,
                response = CASE WHEN $4 THEN $6 ELSE response END,
                error = CASE WHEN $4 THEN $7 ELSE error END,
                delivered_at = COALESCE(delivered_at, $8),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($9)
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.status.to_string())
        .bind(update.attempts.map(|a| i32::try_from(a).unwrap_or(i32::MAX)))
        .bind(outcome.is_some())
        .bind(outcome.and_then(|o| o.status_code).map(i32::from))
        .bind(outcome.and_then(|o| o.response.clone()))
        .bind(outcome.and_then(|o| o.error.clone()))
        .bind(outcome.and_then(|o| o.delivered_at))
        .bind(&predecessors)
        .fetch_optional(&*self.pool)
        .await?;

        match updated {
            Some(delivery) => Ok(delivery),
            None => Err(self.rejection(id, update.status).await),
        }
    }

    /// Resets a failed delivery to a fresh pending cycle.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the delivery is failed.
    pub async fn reset_for_retry(&self, id: DeliveryId) -> Result<Delivery> {
        let reset = sqlx::query_as::<_, Delivery>(&format!(
            r#"
            UPDATE deliveries
            SET status = 'pending', attempts = 0, status_code = NULL,
                response = NULL, error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        match reset {
            Some(delivery) => Ok(delivery),
            None => Err(self.rejection(id, DeliveryStatus::Pending).await),
        }
    }

    /// Counts deliveries per status for a subscription since `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(
        &self,
        subscription_id: SubscriptionId,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DeliveryStatus, u64)>> {
        let rows: Vec<(DeliveryStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM deliveries
            WHERE subscription_id = $1 AND created_at >= $2
            GROUP BY status
            "#,
        )
        .bind(subscription_id)
        .bind(since)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (status, u64::try_from(count).unwrap_or(0)))
            .collect())
    }

    async fn rejection(&self, id: DeliveryId, to: DeliveryStatus) -> CoreError {
        match self.find_by_id(id).await {
            Ok(Some(current)) => CoreError::InvalidTransition { from: current.status, to },
            Ok(None) => CoreError::NotFound(format!("delivery {id}")),
            Err(e) => e,
        }
    }
}
