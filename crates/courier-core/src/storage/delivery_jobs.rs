//! Durable job table backing the delivery queue.
//!
//! A job row is visible once `run_at` has passed and it holds no live lease.
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block
//! on, or double-claim, the same row. A lease that expires without an ack
//! makes the row claimable again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryJob, JobId},
};

/// A claimed job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeasedJobRow {
    /// Job identifier.
    pub id: JobId,
    /// Job snapshot.
    pub job: Json<DeliveryJob>,
    /// Token identifying this lease.
    pub lease_token: Uuid,
    /// Lease expiry.
    pub locked_until: DateTime<Utc>,
    /// How many times the row has been claimed, including this one.
    pub claim_count: i32,
}

/// Repository for queued delivery jobs.
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

    /// Stores a job that becomes visible at `run_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(&self, job: &DeliveryJob, run_at: DateTime<Utc>) -> Result<JobId> {
        let id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (id, delivery_id, job, run_at, claim_count, enqueued_at)
            VALUES ($1, $2, $3, $4, 0, NOW())
            "#,
        )
        .bind(id)
        .bind(job.delivery_id)
        .bind(Json(job))
        .bind(run_at)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Claims the oldest visible job for `worker` until `locked_until`.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<LeasedJobRow>> {
        let mut tx = self.pool.begin().await?;

        let job_id: Option<JobId> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_jobs
            WHERE run_at <= $1
              AND (locked_until IS NULL OR locked_until <= $1)
            ORDER BY run_at ASC, enqueued_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row = sqlx::query_as::<_, LeasedJobRow>(
            r#"
            UPDATE delivery_jobs
            SET locked_by = $2, locked_until = $3, lease_token = $4,
                claim_count = claim_count + 1
            WHERE id = $1
            RETURNING id, job, lease_token, locked_until, claim_count
            "#,
        )
        .bind(job_id)
        .bind(worker)
        .bind(locked_until)
        .bind(Uuid::new_v4())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(row))
    }

    /// Pushes a lease expiry forward. Returns false if the lease was lost.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn extend_lease(
        &self,
        id: JobId,
        lease_token: Uuid,
        locked_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE delivery_jobs SET locked_until = $3 WHERE id = $1 AND lease_token = $2",
        )
        .bind(id)
        .bind(lease_token)
        .bind(locked_until)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Deletes a job held under `lease_token`. Returns false if the lease
    /// was lost to another worker.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn ack(&self, id: JobId, lease_token: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM delivery_jobs WHERE id = $1 AND lease_token = $2")
            .bind(id)
            .bind(lease_token)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Clears leases that expired before `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET locked_by = NULL, locked_until = NULL, lease_token = NULL
            WHERE locked_until IS NOT NULL AND locked_until <= $1
            "#,
        )
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Number of jobs stored, leased or not.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn depth(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs")
            .fetch_one(&*self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
