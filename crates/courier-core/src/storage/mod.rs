//! PostgreSQL repositories for deliveries, queued jobs and subscriptions.
//!
//! Every SQL statement the pipeline issues lives in this module. Higher
//! layers talk to the repositories through the delivery crate's store and
//! queue traits, which also have in-memory implementations for tests.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod delivery_jobs;
pub mod subscriptions;

use crate::error::Result;

/// Idempotent DDL for the tables the repositories use.
///
/// The subscription table is owned by the admin surface; it is created here
/// only so a fresh database can run the pipeline end to end.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhook_subscriptions (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        url TEXT NOT NULL,
        auth_type TEXT NOT NULL DEFAULT 'NONE',
        auth_header_name TEXT,
        auth_value TEXT,
        secret TEXT,
        timeout_ms BIGINT NOT NULL DEFAULT 30000,
        max_retries INT NOT NULL DEFAULT 3,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        events TEXT[] NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliveries (
        id UUID PRIMARY KEY,
        subscription_id UUID NOT NULL,
        event TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'retrying', 'delivered', 'failed')),
        attempts INT NOT NULL DEFAULT 0,
        status_code INT,
        response TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        delivered_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_deliveries_subscription_created \
     ON deliveries (subscription_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS delivery_jobs (
        id UUID PRIMARY KEY,
        delivery_id UUID NOT NULL,
        job JSONB NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        locked_by TEXT,
        locked_until TIMESTAMPTZ,
        lease_token UUID,
        claim_count INT NOT NULL DEFAULT 0,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_delivery_jobs_visible \
     ON delivery_jobs (run_at, enqueued_at)",
];

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Delivery records.
    pub deliveries: Arc<deliveries::Repository>,

    /// Queued attempts.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    /// Subscription lookups.
    pub subscriptions: Arc<subscriptions::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool)),
        }
    }

    /// Applies [`SCHEMA`].
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.deliveries.pool();
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }
        Ok(())
    }

    /// Verifies database connectivity. Backs the readiness probe.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.deliveries.pool()).await?;

        Ok(())
    }
}
