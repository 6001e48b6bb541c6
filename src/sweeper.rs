use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SweeperConfig;
use crate::store::{AuditStore, GuardStore};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub audit_deleted: u64,
    pub audit_batches: u32,
    pub expired_keys: u64,
    pub errors: u32,
}

/// Periodic retention cleanup for audit records and lapsed guard keys.
///
/// Runs on its own task and timer; a failed sweep is logged and retried on
/// the next tick.
#[derive(Clone)]
pub struct RetentionSweeper {
    audit: Arc<dyn AuditStore>,
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    interval: StdDuration,
    batch_size: u32,
    max_batches_per_run: u32,
}

impl RetentionSweeper {
    pub fn new(
        config: &SweeperConfig,
        retention: Duration,
        audit: Arc<dyn AuditStore>,
        store: Arc<dyn GuardStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            audit,
            store,
            clock,
            retention,
            interval: StdDuration::from_secs(config.interval_secs.max(1)),
            batch_size: config.batch_size.max(1),
            max_batches_per_run: config.max_batches_per_run.max(1),
        }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let mut report = SweepReport::default();

        while report.audit_batches < self.max_batches_per_run {
            match self.audit.delete_older_than(cutoff, self.batch_size).await {
                Ok(deleted) => {
                    report.audit_batches += 1;
                    report.audit_deleted += deleted;
                    if deleted < u64::from(self.batch_size) {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, cutoff = %cutoff, "Audit retention delete failed");
                    report.errors += 1;
                    break;
                }
            }
        }

        if report.audit_batches == self.max_batches_per_run {
            debug!(
                batches = report.audit_batches,
                "Audit retention batch limit reached; remainder left for next run"
            );
        }

        match self.store.purge_expired(now).await {
            Ok(removed) => report.expired_keys = removed,
            Err(e) => {
                error!(error = %e, "Expired key purge failed");
                report.errors += 1;
            }
        }

        info!(
            audit_deleted = report.audit_deleted,
            expired_keys = report.expired_keys,
            errors = report.errors,
            "Retention sweep finished"
        );
        report
    }

    /// Spawn the periodic task. The first sweep runs one interval after start.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Retention sweeper started");
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = &mut shutdown => {
                    info!("Retention sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Owns the running sweeper; dropping it signals shutdown
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal shutdown and wait for an in-flight sweep to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Retention sweeper task ended abnormally");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
