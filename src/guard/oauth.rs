// OAuth guard stages
// Composed per action in `Guards::new`: rate limit first, then request shape,
// then caller checks, replay consumption last.

use std::sync::Arc;

use async_trait::async_trait;

use super::{GuardStage, RequestContext, Verdict};
use crate::clock::Clock;
use crate::error::GuardError;
use crate::security::{Admission, RateLimiter, ReplayGuard};

pub struct RateLimitStage {
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter, clock: Arc<dyn Clock>) -> Self {
        Self { limiter, clock }
    }
}

#[async_trait]
impl GuardStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        match self.limiter.check(ctx).await {
            Ok(Admission::Allowed(result)) => Verdict::Metered(result.status(self.clock.now())),
            Ok(Admission::Skipped(_)) => Verdict::Continue,
            Ok(Admission::Limited(result)) => Verdict::Reject(GuardError::RateLimited {
                message: self.limiter.rule().message.clone(),
                limit: result.limit,
                reset_after_secs: result.reset_after_secs(self.clock.now()),
            }),
            // counters unreachable: refuse rather than admit unmetered traffic
            Err(e) => Verdict::Reject(e.into()),
        }
    }
}

/// Path platform must be one of the configured providers
#[derive(Clone)]
pub struct PlatformStage {
    allowed: Vec<String>,
}

impl PlatformStage {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

#[async_trait]
impl GuardStage for PlatformStage {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let Some(platform) = ctx.platform.as_deref() else {
            return Verdict::Reject(GuardError::Validation {
                message: "Platform is required".to_string(),
                platform: None,
                allowed_platforms: Some(self.allowed.clone()),
            });
        };

        if self.allowed.iter().any(|p| p == platform) {
            Verdict::Continue
        } else {
            Verdict::Reject(GuardError::Validation {
                message: "Unsupported platform".to_string(),
                platform: Some(platform.to_string()),
                allowed_platforms: Some(self.allowed.clone()),
            })
        }
    }
}

/// Browser-originated calls must come from a configured origin. Requests
/// without an `Origin` header, or an empty allow-list, pass.
#[derive(Clone)]
pub struct OriginStage {
    allowed: Vec<String>,
}

impl OriginStage {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }
}

#[async_trait]
impl GuardStage for OriginStage {
    fn name(&self) -> &'static str {
        "origin"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        match ctx.origin.as_deref() {
            Some(origin)
                if !self.allowed.is_empty()
                    && !self
                        .allowed
                        .iter()
                        .any(|a| a.trim_end_matches('/') == origin.trim_end_matches('/')) =>
            {
                Verdict::Reject(GuardError::Authorization(
                    "Request origin not allowed".to_string(),
                ))
            }
            _ => Verdict::Continue,
        }
    }
}

#[derive(Clone)]
pub struct PermissionStage {
    allowed_roles: Vec<String>,
}

impl PermissionStage {
    pub fn new(allowed_roles: Vec<String>) -> Self {
        Self { allowed_roles }
    }
}

#[async_trait]
impl GuardStage for PermissionStage {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let Some(user) = &ctx.user else {
            return Verdict::Reject(GuardError::Authorization(
                "Authentication required".to_string(),
            ));
        };

        if self.allowed_roles.iter().any(|r| r == &user.role) {
            Verdict::Continue
        } else {
            Verdict::Reject(GuardError::Authorization(
                "Insufficient permissions to manage social accounts".to_string(),
            ))
        }
    }
}

/// Provider redirect must carry `state` and `code` and no `error`
pub struct CallbackParamsStage;

#[async_trait]
impl GuardStage for CallbackParamsStage {
    fn name(&self) -> &'static str {
        "callback_params"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let platform = ctx.platform.clone();
        let reject = |message: String| {
            Verdict::Reject(GuardError::Validation {
                message,
                platform: platform.clone(),
                allowed_platforms: None,
            })
        };

        if let Some(error) = ctx.query_param("error") {
            let detail = ctx.query_param("error_description").unwrap_or(error);
            return reject(format!("OAuth authorization failed: {}", detail));
        }
        if ctx.query_param("state").is_none_or(str::is_empty) {
            return reject("Missing OAuth state parameter".to_string());
        }
        if ctx.query_param("code").is_none_or(str::is_empty) {
            return reject("Missing OAuth authorization code".to_string());
        }
        Verdict::Continue
    }
}

/// Consumes the callback's state value; a second use is a replay
pub struct ReplayStage {
    replay: ReplayGuard,
}

impl ReplayStage {
    pub fn new(replay: ReplayGuard) -> Self {
        Self { replay }
    }
}

#[async_trait]
impl GuardStage for ReplayStage {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        let Some(state) = ctx.query_param("state") else {
            return Verdict::Reject(GuardError::validation("Missing OAuth state parameter"));
        };
        self.replay.consume(state).await.map_err(GuardError::from).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Environment, RateLimitConfig, RateLimitRule};
    use crate::guard::AuthUser;
    use crate::security::RateLimiters;
    use crate::store::MemoryStore;
    use axum::http::{Method, StatusCode};
    use chrono::Duration;

    fn reject_of(verdict: Verdict) -> GuardError {
        match verdict {
            Verdict::Reject(err) => err,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    fn callback(platform: &str) -> RequestContext {
        RequestContext::new(Method::GET, format!("/oauth/{}/callback", platform))
    }

    #[tokio::test]
    async fn rate_limit_stage_reports_configured_message() {
        let clock = Arc::new(ManualClock::default());
        let config = RateLimitConfig {
            callback: RateLimitRule::new(60_000, 1, "Too many OAuth callback attempts"),
            ..RateLimitConfig::default()
        };
        let limiters = RateLimiters::from_config(
            Environment::Production,
            &config,
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );
        let stage = RateLimitStage::new(limiters.callback.clone(), clock.clone());
        let ctx = callback("linkedin").with_client_ip("10.0.0.1");

        match stage.evaluate(&ctx).await {
            Verdict::Metered(status) => {
                assert_eq!(status.limit, 1);
                assert_eq!(status.remaining, 0);
                assert_eq!(status.reset_after_secs, 60);
            }
            other => panic!("expected metered admission, got {:?}", other),
        }
        clock.advance(Duration::seconds(15));
        match reject_of(stage.evaluate(&ctx).await) {
            GuardError::RateLimited {
                message,
                limit,
                reset_after_secs,
            } => {
                assert_eq!(message, "Too many OAuth callback attempts");
                assert_eq!(limit, 1);
                assert_eq!(reset_after_secs, 45);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn platform_must_be_allowed() {
        let stage = PlatformStage::new(vec!["linkedin".to_string(), "twitter".to_string()]);
        assert!(matches!(
            stage.evaluate(&callback("linkedin")).await,
            Verdict::Continue
        ));

        let err = reject_of(stage.evaluate(&callback("myspace")).await);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        match err {
            GuardError::Validation {
                platform,
                allowed_platforms,
                ..
            } => {
                assert_eq!(platform.as_deref(), Some("myspace"));
                assert_eq!(allowed_platforms.map(|p| p.len()), Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn origin_checked_only_when_present_and_configured() {
        let open = OriginStage::new(Vec::new());
        let ctx = callback("linkedin").with_origin("https://evil.example");
        assert!(matches!(open.evaluate(&ctx).await, Verdict::Continue));

        let strict = OriginStage::new(vec!["https://app.example.com/".to_string()]);
        assert!(matches!(
            reject_of(strict.evaluate(&ctx).await),
            GuardError::Authorization(_)
        ));
        let ok = callback("linkedin").with_origin("https://app.example.com");
        assert!(matches!(strict.evaluate(&ok).await, Verdict::Continue));
        assert!(matches!(
            strict.evaluate(&callback("linkedin")).await,
            Verdict::Continue
        ));
    }

    #[tokio::test]
    async fn permission_requires_allowed_role() {
        let stage = PermissionStage::new(vec!["owner".to_string(), "admin".to_string()]);

        let anonymous = callback("twitter");
        assert_eq!(
            reject_of(stage.evaluate(&anonymous).await).status_code(),
            StatusCode::FORBIDDEN
        );

        let viewer = callback("twitter").with_user(AuthUser::new("u1", None, "viewer"));
        assert!(matches!(
            reject_of(stage.evaluate(&viewer).await),
            GuardError::Authorization(_)
        ));

        let admin = callback("twitter").with_user(AuthUser::new("u2", None, "admin"));
        assert!(matches!(stage.evaluate(&admin).await, Verdict::Continue));
    }

    #[tokio::test]
    async fn callback_params_are_required() {
        let stage = CallbackParamsStage;

        let missing_state = callback("linkedin").with_query("code", "c1");
        assert_eq!(
            reject_of(stage.evaluate(&missing_state).await).to_string(),
            "Missing OAuth state parameter"
        );

        let missing_code = callback("linkedin").with_query("state", "st_1");
        assert_eq!(
            reject_of(stage.evaluate(&missing_code).await).to_string(),
            "Missing OAuth authorization code"
        );

        let provider_error = callback("linkedin")
            .with_query("error", "access_denied")
            .with_query("state", "st_1");
        assert!(
            reject_of(stage.evaluate(&provider_error).await)
                .to_string()
                .contains("access_denied")
        );

        let complete = callback("linkedin")
            .with_query("state", "st_1")
            .with_query("code", "c1");
        assert!(matches!(stage.evaluate(&complete).await, Verdict::Continue));
    }

    #[tokio::test]
    async fn replay_stage_consumes_once() {
        let stage = ReplayStage::new(ReplayGuard::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
            Duration::hours(1),
        ));
        let ctx = callback("linkedin")
            .with_query("state", "st_001")
            .with_query("code", "c");

        assert!(matches!(stage.evaluate(&ctx).await, Verdict::Continue));
        let err = reject_of(stage.evaluate(&ctx).await);
        assert!(matches!(err, GuardError::Replay));
        assert_eq!(err.to_string(), "OAuth state parameter has already been used");
    }
}
