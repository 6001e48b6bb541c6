//! Guard pipelines.
//!
//! Each protected route class owns an ordered list of [`GuardStage`]s. The
//! runner evaluates them in order against one immutable [`RequestContext`]
//! and stops at the first rejection, so stage order decides which rejection
//! a request sees.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{ErrorKind, GuardError};
use crate::security::{
    AuditPipeline, OAuthAction, RateLimitStatus, RateLimiters, ReplayGuard, SecretManager,
    SecurityEvent,
};

pub mod context;
pub mod csrf;
pub mod oauth;

pub use context::{AuthUser, RequestContext};
pub use csrf::CsrfStage;
pub use oauth::{
    CallbackParamsStage, OriginStage, PermissionStage, PlatformStage, RateLimitStage, ReplayStage,
};

/// Route classes with their own stage list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Csrf,
    OAuthInitiate,
    OAuthCallback,
    OAuthRefresh,
}

impl RouteClass {
    /// Action name written to audit events
    pub fn audit_action(&self) -> &'static str {
        match self {
            RouteClass::Csrf => "csrf_validation",
            RouteClass::OAuthInitiate => "oauth_initiate",
            RouteClass::OAuthCallback => "oauth_callback",
            RouteClass::OAuthRefresh => "oauth_refresh",
        }
    }
}

/// Outcome of a single stage
#[derive(Debug)]
pub enum Verdict {
    Continue,
    /// Continue; the request was counted against a rate limit
    Metered(RateLimitStatus),
    Reject(GuardError),
}

/// What a passing pipeline hands back to the response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clearance {
    pub rate_limit: Option<RateLimitStatus>,
}

impl Clearance {
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(status) = &self.rate_limit {
            status.apply(headers);
        }
    }
}

impl From<Result<(), GuardError>> for Verdict {
    fn from(result: Result<(), GuardError>) -> Self {
        match result {
            Ok(()) => Verdict::Continue,
            Err(e) => Verdict::Reject(e),
        }
    }
}

#[async_trait]
pub trait GuardStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict;
}

/// Audit draft pre-filled with the caller's identity and request details
pub fn security_event(ctx: &RequestContext, action: &str, success: bool) -> SecurityEvent {
    let (user_id, organization_id) = match &ctx.user {
        Some(user) => (Some(user.user_id.clone()), user.organization_id.clone()),
        None => (None, None),
    };
    SecurityEvent::new(action, success)
        .with_user(user_id, organization_id)
        .with_request_context(Some(ctx.client_ip.clone()), ctx.user_agent.clone())
        .with_platform(ctx.platform.clone())
}

/// Ordered stages for one route class
#[derive(Clone)]
pub struct GuardPipeline {
    route: RouteClass,
    stages: Vec<Arc<dyn GuardStage>>,
    audit: AuditPipeline,
}

impl GuardPipeline {
    pub fn new(route: RouteClass, audit: AuditPipeline) -> Self {
        Self {
            route,
            stages: Vec::new(),
            audit,
        }
    }

    pub fn stage(mut self, stage: impl GuardStage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn route(&self) -> RouteClass {
        self.route
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order; the first rejection wins and is audited
    pub async fn run(&self, ctx: &RequestContext) -> Result<Clearance, GuardError> {
        let mut clearance = Clearance::default();
        for stage in &self.stages {
            match stage.evaluate(ctx).await {
                Verdict::Continue => continue,
                Verdict::Metered(status) => clearance.rate_limit = Some(status),
                Verdict::Reject(err) => {
                    self.on_reject(stage.name(), ctx, &err);
                    return Err(err);
                }
            }
        }

        debug!(
            route = ?self.route,
            request_id = %ctx.request_id,
            "Guard pipeline passed"
        );
        Ok(clearance)
    }

    fn on_reject(&self, stage: &'static str, ctx: &RequestContext, err: &GuardError) {
        if err.kind() == ErrorKind::Internal {
            error!(
                route = ?self.route,
                stage,
                request_id = %ctx.request_id,
                path = %ctx.path,
                error = %err,
                "Guard stage failed"
            );
        } else {
            warn!(
                route = ?self.route,
                stage,
                request_id = %ctx.request_id,
                path = %ctx.path,
                ip = %ctx.client_ip,
                error = %err,
                "Request rejected by guard"
            );
        }

        let event = security_event(ctx, self.route.audit_action(), false)
            .with_error(format!("{}: {}", stage, err));
        self.audit.dispatch(event);
    }
}

/// Pipelines for every protected route class
#[derive(Clone)]
pub struct Guards {
    pub csrf: GuardPipeline,
    pub initiate: GuardPipeline,
    pub callback: GuardPipeline,
    pub refresh: GuardPipeline,
}

impl Guards {
    pub fn new(
        config: &Config,
        secrets: SecretManager,
        replay: ReplayGuard,
        limiters: RateLimiters,
        audit: AuditPipeline,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let csrf = GuardPipeline::new(RouteClass::Csrf, audit.clone())
            .stage(CsrfStage::new(config.csrf.clone(), secrets, clock.clone()));

        let platform = PlatformStage::new(config.oauth.allowed_platforms.clone());
        let origin = OriginStage::new(config.oauth.allowed_origins.clone());
        let permission = PermissionStage::new(config.oauth.allowed_roles.clone());

        let initiate = GuardPipeline::new(RouteClass::OAuthInitiate, audit.clone())
            .stage(RateLimitStage::new(
                limiters.for_action(OAuthAction::Initiate).clone(),
                clock.clone(),
            ))
            .stage(platform.clone())
            .stage(origin.clone())
            .stage(permission.clone());

        let callback = GuardPipeline::new(RouteClass::OAuthCallback, audit.clone())
            .stage(RateLimitStage::new(
                limiters.for_action(OAuthAction::Callback).clone(),
                clock.clone(),
            ))
            .stage(platform.clone())
            .stage(CallbackParamsStage)
            .stage(ReplayStage::new(replay));

        let refresh = GuardPipeline::new(RouteClass::OAuthRefresh, audit)
            .stage(RateLimitStage::new(
                limiters.for_action(OAuthAction::Refresh).clone(),
                clock.clone(),
            ))
            .stage(platform)
            .stage(origin)
            .stage(permission);

        Self {
            csrf,
            initiate,
            callback,
            refresh,
        }
    }

    pub fn for_route(&self, route: RouteClass) -> &GuardPipeline {
        match route {
            RouteClass::Csrf => &self.csrf,
            RouteClass::OAuthInitiate => &self.initiate,
            RouteClass::OAuthCallback => &self.callback,
            RouteClass::OAuthRefresh => &self.refresh,
        }
    }
}
