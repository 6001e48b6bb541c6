use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::{AuditCache, AuditStore, GuardStore, StoreError, WindowCount};
use crate::config::StoreConfig;
use crate::security::audit::AuditEvent;

/// PostgreSQL implementation of every storage capability.
///
/// Each primitive is one statement (`INSERT ... ON CONFLICT ... RETURNING`),
/// so atomicity comes from row locking in the database rather than from the
/// calling code.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new database connection pool
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let connection_string = config
            .database_url
            .as_ref()
            .context("Database connection string is required")?;

        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(StdDuration::from_millis(config.acquire_timeout_ms))
            .connect(connection_string)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        let store = Self { pool };
        if config.auto_migrate {
            store.migrate().await?;
        } else {
            warn!("Auto-migration is disabled. Run migrations manually with: sqlx migrate run");
        }
        Ok(store)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;
        Ok(())
    }
}

#[async_trait]
impl GuardStore for PgStore {
    async fn get_or_insert(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let row = sqlx::query(
            "INSERT INTO guard_entries (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET
               value = CASE WHEN guard_entries.expires_at <= $4
                            THEN EXCLUDED.value ELSE guard_entries.value END,
               expires_at = CASE WHEN guard_entries.expires_at <= $4
                                 THEN EXCLUDED.expires_at ELSE guard_entries.expires_at END
             RETURNING value",
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("value")?)
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // The conditional update only fires over an expired row; a live row
        // yields no RETURNING output.
        let row = sqlx::query(
            "INSERT INTO guard_entries (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET
               value = EXCLUDED.value,
               expires_at = EXCLUDED.expires_at
             WHERE guard_entries.expires_at <= $4
             RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        let row = sqlx::query(
            "INSERT INTO rate_counters (key, window_start, count, expires_at) VALUES ($1, $2, 1, $3)
             ON CONFLICT (key) DO UPDATE SET
               count = CASE WHEN rate_counters.expires_at > $2
                            THEN rate_counters.count + 1 ELSE 1 END,
               window_start = CASE WHEN rate_counters.expires_at > $2
                                   THEN rate_counters.window_start ELSE $2 END,
               expires_at = CASE WHEN rate_counters.expires_at > $2
                                 THEN rate_counters.expires_at ELSE $3 END
             RETURNING count, window_start, expires_at",
        )
        .bind(key)
        .bind(now)
        .bind(now + window)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(WindowCount {
            count: u64::try_from(count).unwrap_or(0),
            window_start: row.try_get("window_start")?,
            resets_at: row.try_get("expires_at")?,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let entries = sqlx::query("DELETE FROM guard_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let counters = sqlx::query("DELETE FROM rate_counters WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(entries, counters, "Purged expired guard rows");
        Ok(entries + counters)
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events
               (id, user_id, organization_id, platform, action, success, ip, user_agent, error, environment, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(&event.user_id)
        .bind(&event.organization_id)
        .bind(&event.platform)
        .bind(&event.action)
        .bind(event.success)
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.error)
        .bind(&event.environment)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM audit_events WHERE id IN (
               SELECT id FROM audit_events WHERE created_at < $1
               ORDER BY created_at LIMIT $2
             )",
        )
        .bind(cutoff)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditCache for PgStore {
    async fn put(
        &self,
        key: &str,
        event: &AuditEvent,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(event)?;
        sqlx::query(
            "INSERT INTO guard_entries (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
