use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod middleware;
pub mod security;
pub mod store;
pub mod sweeper;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend, StoreConfig};
use crate::guard::{Guards, RouteClass};
use crate::security::{AuditPipeline, RateLimiters, ReplayGuard, SecretManager};
use crate::store::{AuditCache, AuditStore, GuardStore, MemoryAuditStore, MemoryStore, PgStore};
use crate::sweeper::RetentionSweeper;

/// Storage handles shared by the guards, the audit pipeline and the sweeper
#[derive(Clone)]
pub struct Backends {
    pub guard_store: Arc<dyn GuardStore>,
    pub audit_store: Arc<dyn AuditStore>,
    pub audit_cache: Arc<dyn AuditCache>,
    pub database: Option<Arc<PgStore>>,
}

impl Backends {
    /// Single-process backend; state is lost on restart
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            guard_store: store.clone(),
            audit_store: Arc::new(MemoryAuditStore::new()),
            audit_cache: store,
            database: None,
        }
    }

    pub async fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        match config.backend {
            StoreBackend::Memory => {
                info!("Using in-memory guard store");
                Ok(Self::memory())
            }
            StoreBackend::Postgres => {
                let pg = Arc::new(
                    PgStore::connect(config)
                        .await
                        .context("Failed to initialise PostgreSQL guard store")?,
                );
                Ok(Self {
                    guard_store: pg.clone(),
                    audit_store: pg.clone(),
                    audit_cache: pg.clone(),
                    database: Some(pg),
                })
            }
        }
    }
}

/// Shared application state handed to middleware and handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub secrets: SecretManager,
    pub audit: AuditPipeline,
    pub guards: Guards,
    pub database: Option<Arc<PgStore>>,
}

impl AppState {
    pub fn new(config: Config, backends: &Backends, clock: Arc<dyn Clock>) -> Self {
        let secrets = SecretManager::new(
            backends.guard_store.clone(),
            clock.clone(),
            config.csrf.session_ttl(),
        );
        let replay = ReplayGuard::new(
            backends.guard_store.clone(),
            clock.clone(),
            config.oauth.state_ttl(),
        );
        let limiters = RateLimiters::from_config(
            config.environment,
            &config.rate_limits,
            backends.guard_store.clone(),
            clock.clone(),
        );
        let audit = AuditPipeline::with_capacity(
            backends.audit_store.clone(),
            backends.audit_cache.clone(),
            clock.clone(),
            config.environment,
            config.audit.cache_ttl(),
            config.audit.queue_capacity,
        );
        let guards = Guards::new(
            &config,
            secrets.clone(),
            replay,
            limiters,
            audit.clone(),
            clock.clone(),
        );

        Self {
            config: Arc::new(config),
            clock,
            secrets,
            audit,
            guards,
            database: backends.database.clone(),
        }
    }
}

/// Assemble routes, guards and the outer middleware stack
pub fn build_router(state: AppState) -> Router {
    let guarded = |route: RouteClass| {
        from_fn_with_state((state.clone(), route), middleware::guard_middleware)
    };

    let csrf_routes = Router::new()
        .route(
            "/api/posts",
            get(handlers::list_posts).post(handlers::create_post),
        )
        .route_layer(guarded(RouteClass::Csrf));

    let initiate = Router::new()
        .route("/oauth/{platform}/initiate", get(handlers::oauth_initiate))
        .route_layer(guarded(RouteClass::OAuthInitiate));

    let callback = Router::new()
        .route("/oauth/{platform}/callback", get(handlers::oauth_callback))
        .route_layer(guarded(RouteClass::OAuthCallback));

    let refresh = Router::new()
        .route("/oauth/{platform}/refresh", post(handlers::oauth_refresh))
        .route_layer(guarded(RouteClass::OAuthRefresh));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/csrf-token", get(handlers::csrf_token))
        .merge(csrf_routes)
        .merge(initiate)
        .merge(callback)
        .merge(refresh)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::context_middleware,
        ))
        .layer(from_fn(middleware::security_headers_middleware))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A server started by [`start_server_with_config`]
pub struct RunningServer {
    pub port: u16,
    task: JoinHandle<()>,
}

impl RunningServer {
    /// Resolves once the server has shut down, queued audit events are
    /// written and the sweeper has stopped
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Server task failed");
        }
    }
}

/// Starts the server on the configured address. The server runs until
/// `shutdown_rx` fires; the audit queue is drained and the retention sweeper
/// stopped with it.
pub async fn start_server_with_config(
    config: Config,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<RunningServer> {
    let backends = Backends::from_config(&config.store).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sweeper = RetentionSweeper::new(
        &config.sweeper,
        config.audit.retention(),
        backends.audit_store.clone(),
        backends.guard_store.clone(),
        clock.clone(),
    );

    let addr = config.server_addr();
    let environment = config.environment;
    let state = AppState::new(config, &backends, clock);
    let audit = state.audit.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        environment = environment.as_str(),
        "authguard listening"
    );

    let sweeper = sweeper.start();

    let task = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
            info!("Shutdown signal received");
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "Server error");
        }
        audit.flush().await;
        sweeper.stop().await;
        info!("Server stopped");
    });

    Ok(RunningServer {
        port: local_addr.port(),
        task,
    })
}
