use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Environment;
use crate::store::{AuditCache, AuditStore};

/// Security event as reported by a guard stage or handler, before the
/// pipeline stamps it.
#[derive(Debug, Clone, Default)]
pub struct SecurityEvent {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub platform: Option<String>,
    pub action: String,
    pub success: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub error: Option<String>,
}

impl SecurityEvent {
    pub fn new(action: impl Into<String>, success: bool) -> Self {
        Self {
            action: action.into(),
            success,
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: Option<String>, organization_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.organization_id = organization_id;
        self
    }

    pub fn with_request_context(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Freeze into an immutable audit record
    pub fn into_record(self, timestamp: DateTime<Utc>, environment: &str) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            organization_id: self.organization_id,
            platform: self.platform,
            action: self.action,
            success: self.success,
            ip: self.ip,
            user_agent: self.user_agent,
            error: self.error,
            timestamp,
            environment: environment.to_string(),
        }
    }
}

/// Immutable audit record as written to the durable store and the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub platform: Option<String>,
    pub action: String,
    pub success: bool,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
}

impl AuditEvent {
    /// Cache key: identity (user, else IP) plus millisecond timestamp
    pub fn cache_key(&self) -> String {
        let identity = self
            .user_id
            .as_deref()
            .or(self.ip.as_deref())
            .unwrap_or("anonymous");
        format!(
            "audit:{}:{}:{}",
            identity,
            self.timestamp.timestamp_millis(),
            self.id.simple()
        )
    }
}

/// Default number of events that may wait for the audit worker
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

enum AuditMessage {
    Record(SecurityEvent),
    Flush(oneshot::Sender<()>),
}

/// Best-effort audit writer.
///
/// Audit logging is observability, not a gate: [`AuditPipeline::record`]
/// never returns an error, and [`AuditPipeline::dispatch`] only enqueues.
/// One worker task drains the bounded queue; when it is full, new events are
/// dropped with a warning instead of piling up behind a stalled store.
#[derive(Clone)]
pub struct AuditPipeline {
    writer: Arc<AuditWriter>,
    queue: mpsc::Sender<AuditMessage>,
}

struct AuditWriter {
    durable: Arc<dyn AuditStore>,
    cache: Arc<dyn AuditCache>,
    clock: Arc<dyn Clock>,
    environment: Environment,
    cache_ttl: Duration,
}

impl AuditPipeline {
    /// Must be called inside a Tokio runtime; spawns the queue worker.
    pub fn new(
        durable: Arc<dyn AuditStore>,
        cache: Arc<dyn AuditCache>,
        clock: Arc<dyn Clock>,
        environment: Environment,
        cache_ttl: Duration,
    ) -> Self {
        Self::with_capacity(
            durable,
            cache,
            clock,
            environment,
            cache_ttl,
            DEFAULT_QUEUE_CAPACITY,
        )
    }

    pub fn with_capacity(
        durable: Arc<dyn AuditStore>,
        cache: Arc<dyn AuditCache>,
        clock: Arc<dyn Clock>,
        environment: Environment,
        cache_ttl: Duration,
        capacity: usize,
    ) -> Self {
        let writer = Arc::new(AuditWriter {
            durable,
            cache,
            clock,
            environment,
            cache_ttl,
        });
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(Arc::clone(&writer), receiver));
        Self { writer, queue }
    }

    /// Stamp the event and write it to both stores. Failures are logged and
    /// swallowed.
    pub async fn record(&self, event: SecurityEvent) -> AuditEvent {
        self.writer.record(event).await
    }

    /// Queue the event for the worker so the caller's response is never delayed
    pub fn dispatch(&self, event: SecurityEvent) {
        match self.queue.try_send(AuditMessage::Record(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(AuditMessage::Record(event))) => {
                warn!(
                    action = %event.action,
                    success = event.success,
                    user_id = ?event.user_id,
                    "Audit queue full, event dropped"
                );
            }
            Err(_) => warn!("Audit worker stopped, event dropped"),
        }
    }

    /// Wait until every event dispatched before this call has been written
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.queue.send(AuditMessage::Flush(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }
}

async fn run_worker(writer: Arc<AuditWriter>, mut receiver: mpsc::Receiver<AuditMessage>) {
    while let Some(message) = receiver.recv().await {
        match message {
            AuditMessage::Record(event) => {
                writer.record(event).await;
            }
            AuditMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Audit worker stopped");
}

impl AuditWriter {
    async fn record(&self, event: SecurityEvent) -> AuditEvent {
        let now = self.clock.now();
        let record = event.into_record(now, self.environment.as_str());
        let key = record.cache_key();

        let (durable, cached) = tokio::join!(
            self.durable.append(&record),
            self.cache.put(&key, &record, self.cache_ttl, now),
        );

        if let Err(e) = durable {
            warn!(
                event_id = %record.id,
                action = %record.action,
                error = %e,
                "Failed to write audit event to durable store"
            );
        }
        if let Err(e) = cached {
            warn!(
                event_id = %record.id,
                action = %record.action,
                error = %e,
                "Failed to write audit event to cache"
            );
        }

        if record.success {
            debug!(
                event_id = %record.id,
                action = %record.action,
                platform = ?record.platform,
                user_id = ?record.user_id,
                "Audit event recorded"
            );
        } else {
            info!(
                event_id = %record.id,
                action = %record.action,
                platform = ?record.platform,
                user_id = ?record.user_id,
                ip = ?record.ip,
                error = ?record.error,
                "Security rejection audited"
            );
        }

        record
    }
}
