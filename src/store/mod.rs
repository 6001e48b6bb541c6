//! Shared storage capabilities behind every guard.
//!
//! Guard state (session secrets, consumed OAuth states, rate counters and
//! audit copies) lives behind these traits rather than in process globals, so
//! horizontally scaled instances share one view and tests can swap in
//! [`MemoryStore`]. Every method is a single atomic operation at the storage
//! layer; callers never read-then-write.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::security::audit::AuditEvent;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryAuditStore, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Counter state returned by an atomic window increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Admissions counted in the current window, including this one
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
}

/// Key-value store with per-entry expiry and atomic primitives.
#[async_trait]
pub trait GuardStore: Send + Sync {
    /// Return the live value under `key`, inserting `value` with `ttl` when
    /// the key is absent or expired.
    async fn get_or_insert(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError>;

    /// Insert `value` only when no live entry exists. Returns `true` for the
    /// single caller that performed the insert.
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Count one hit against a tumbling window that starts at the first hit
    /// and lasts `window`.
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError>;

    /// Remove entries and counters whose expiry has passed. Returns the
    /// number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Durable, append-only audit storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError>;

    /// Delete at most `limit` events recorded before `cutoff`, oldest first
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError>;
}

/// Fast, expiring copy of recent audit events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditCache: Send + Sync {
    async fn put(
        &self,
        key: &str,
        event: &AuditEvent,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
