#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use authguard::clock::ManualClock;
use authguard::config::Config;
use authguard::security::AuditEvent;
use authguard::store::{AuditStore, MemoryAuditStore, MemoryStore, StoreError};
use authguard::{AppState, Backends, build_router};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, header};
use chrono::{DateTime, Utc};
use tower::ServiceExt;

/// Socket peer of requests sent without an explicit one
pub const TEST_PEER: ([u8; 4], u16) = ([192, 0, 2, 1], 40_000);

/// Router wired to in-memory stores and a manual clock
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(Config::test_config_with_port(0))
    }

    pub fn with_config(config: Config) -> Self {
        let audit = Arc::new(MemoryAuditStore::new());
        Self::with_audit_store(config, audit.clone(), audit)
    }

    /// `durable` receives audit writes; `audit` is what the helpers inspect
    pub fn with_audit_store(
        config: Config,
        durable: Arc<dyn AuditStore>,
        audit: Arc<MemoryAuditStore>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            guard_store: store.clone(),
            audit_store: durable,
            audit_cache: store.clone(),
            database: None,
        };
        let clock = Arc::new(ManualClock::default());
        let state = AppState::new(config, &backends, clock.clone());
        Self {
            router: build_router(state.clone()),
            state,
            clock,
            store,
            audit,
        }
    }

    /// Send as if connected from [`TEST_PEER`] unless the request already
    /// carries connection info
    pub async fn send(&self, mut request: Request<Body>) -> Response<Body> {
        if request.extensions().get::<ConnectInfo<SocketAddr>>().is_none() {
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from(TEST_PEER)));
        }
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Poll until `predicate` holds for the durable audit log
    pub async fn wait_for_audit<F>(&self, predicate: F) -> Vec<AuditEvent>
    where
        F: Fn(&[AuditEvent]) -> bool,
    {
        for _ in 0..200 {
            let events = self.audit.events();
            if predicate(&events) {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("audit log never matched; found {:?}", self.audit.events());
    }

    pub async fn wait_for_cached_audit(&self, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let keys = self.store.keys_with_prefix("audit:");
            if keys.len() >= n {
                return keys;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} cached audit events", n);
    }
}

/// Attach the socket peer the router sees for this request
pub fn from_peer(mut request: Request<Body>, peer: impl Into<SocketAddr>) -> Request<Body> {
    request.extensions_mut().insert(ConnectInfo(peer.into()));
    request
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    serde_json::from_slice(&bytes).expect("body should be JSON")
}

/// `name=value` pair of the session cookie set on a response
pub fn session_cookie(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("sid="))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

/// Durable audit store that is always unreachable
pub struct FailingAuditStore;

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn append(&self, _event: &AuditEvent) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("audit database offline".to_string()))
    }

    async fn delete_older_than(
        &self,
        _cutoff: DateTime<Utc>,
        _limit: u32,
    ) -> Result<u64, StoreError> {
        Err(StoreError::Unavailable("audit database offline".to_string()))
    }
}
