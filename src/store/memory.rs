use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::{AuditCache, AuditStore, GuardStore, StoreError, WindowCount};
use crate::security::audit::AuditEvent;

#[derive(Debug, Clone)]
struct TtlEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl TtlEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: DateTime<Utc>,
    count: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, TtlEntry>,
    counters: HashMap<String, Counter>,
}

/// In-process [`GuardStore`] and [`AuditCache`].
///
/// Each operation runs under a single lock acquisition, so it is atomic for
/// every task sharing this instance. Expired entries are only overwritten on
/// reuse; [`GuardStore::purge_expired`] removes the rest.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Memory store mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Live value under `key`, if any
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        self.lock_state()
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Keys with the given prefix, live or not
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let guard = self.lock_state();
        let mut keys: Vec<String> = guard
            .entries
            .keys()
            .chain(guard.counters.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Total stored entries and counters, including expired ones
    pub fn len(&self) -> usize {
        let guard = self.lock_state();
        guard.entries.len() + guard.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GuardStore for MemoryStore {
    async fn get_or_insert(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let mut guard = self.lock_state();
        if let Some(entry) = guard.entries.get(key)
            && entry.is_live(now)
        {
            return Ok(entry.value.clone());
        }
        guard.entries.insert(
            key.to_string(),
            TtlEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(value.to_string())
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock_state();
        if guard
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
        {
            return Ok(false);
        }
        guard.entries.insert(
            key.to_string(),
            TtlEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount, StoreError> {
        let mut guard = self.lock_state();
        let counter = guard
            .counters
            .entry(key.to_string())
            .and_modify(|c| {
                if c.expires_at > now {
                    c.count += 1;
                } else {
                    *c = Counter {
                        window_start: now,
                        count: 1,
                        expires_at: now + window,
                    };
                }
            })
            .or_insert(Counter {
                window_start: now,
                count: 1,
                expires_at: now + window,
            });

        Ok(WindowCount {
            count: counter.count,
            window_start: counter.window_start,
            resets_at: counter.expires_at,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.lock_state();
        let before = guard.entries.len() + guard.counters.len();
        guard.entries.retain(|_, entry| entry.is_live(now));
        guard.counters.retain(|_, counter| counter.expires_at > now);
        let removed = before - (guard.entries.len() + guard.counters.len());
        if removed > 0 {
            debug!(removed, "Purged expired memory store entries");
        }
        Ok(removed as u64)
    }
}

#[async_trait]
impl AuditCache for MemoryStore {
    async fn put(
        &self,
        key: &str,
        event: &AuditEvent,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(event)?;
        self.lock_state().entries.insert(
            key.to_string(),
            TtlEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}

/// In-process durable audit log, used by the memory backend and tests
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_events(&self) -> MutexGuard<'_, Vec<AuditEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Audit store mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock_events().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.lock_events().push(event.clone());
        Ok(())
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let mut guard = self.lock_events();
        let mut stale: Vec<usize> = guard
            .iter()
            .enumerate()
            .filter(|(_, e)| e.timestamp < cutoff)
            .map(|(i, _)| i)
            .collect();
        stale.sort_by_key(|&i| guard[i].timestamp);
        stale.truncate(limit as usize);
        stale.sort_unstable_by(|a, b| b.cmp(a));

        for index in &stale {
            guard.remove(*index);
        }
        Ok(stale.len() as u64)
    }
}
