// Rate Limiting Module
// Fixed-window admission control per OAuth action and caller identity

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::{Environment, RateLimitConfig, RateLimitRule};
use crate::guard::RequestContext;
use crate::store::{GuardStore, StoreError};

/// OAuth lifecycle actions that carry their own limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthAction {
    Initiate,
    Callback,
    Refresh,
}

impl OAuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthAction::Initiate => "initiate",
            OAuthAction::Callback => "callback",
            OAuthAction::Refresh => "refresh",
        }
    }
}

/// Rate limit key type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Authenticated caller
    UserId(String),
    /// Anonymous caller
    IpAddress(String),
}

impl RateLimitKey {
    /// User-scoped when an authenticated identity exists, else IP-scoped
    pub fn for_request(ctx: &RequestContext) -> Self {
        match &ctx.user {
            Some(user) => RateLimitKey::UserId(user.user_id.clone()),
            None => RateLimitKey::IpAddress(ctx.client_ip.clone()),
        }
    }

    pub fn as_string(&self, action: OAuthAction) -> String {
        match self {
            RateLimitKey::UserId(user_id) => format!("rl:{}:user:{}", action.as_str(), user_id),
            RateLimitKey::IpAddress(ip) => format!("rl:{}:ip:{}", action.as_str(), ip),
        }
    }
}

/// Why a request skipped admission control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TrustedInternalHeader,
    DebugPath,
    DebugBypass,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TrustedInternalHeader => "trusted_internal_header",
            SkipReason::DebugPath => "debug_path",
            SkipReason::DebugBypass => "debug_bypass",
        }
    }
}

/// Skip predicates evaluated before any counter is touched
#[derive(Debug, Clone)]
pub struct BypassPolicy {
    environment: Environment,
    trusted_internal_header: Option<String>,
    debug_path_prefixes: Vec<String>,
    debug_bypass: bool,
}

impl BypassPolicy {
    pub fn from_config(environment: Environment, config: &RateLimitConfig) -> Self {
        if config.debug_bypass {
            error!(
                environment = environment.as_str(),
                "RATE LIMITING DISABLED: rate_limits.debug_bypass is enabled; every OAuth limiter admits all requests"
            );
        }
        Self {
            environment,
            trusted_internal_header: config.trusted_internal_header.clone(),
            debug_path_prefixes: config.debug_path_prefixes.clone(),
            debug_bypass: config.debug_bypass,
        }
    }

    pub fn evaluate(&self, ctx: &RequestContext) -> Option<SkipReason> {
        if self.debug_bypass {
            return Some(SkipReason::DebugBypass);
        }
        if !self.environment.is_production()
            && let Some(header) = &self.trusted_internal_header
            && ctx.headers.contains_key(header.as_str())
        {
            return Some(SkipReason::TrustedInternalHeader);
        }
        if self
            .debug_path_prefixes
            .iter()
            .any(|prefix| ctx.path.starts_with(prefix.as_str()))
        {
            return Some(SkipReason::DebugPath);
        }
        None
    }
}

/// Rate limit result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
    pub key: String,
}

impl RateLimitResult {
    /// Whole seconds until the window resets, rounded up
    pub fn reset_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.resets_at - now).num_milliseconds().max(0);
        u64::try_from((millis + 999) / 1000).unwrap_or(0)
    }

    pub fn status(&self, now: DateTime<Utc>) -> RateLimitStatus {
        RateLimitStatus {
            limit: self.limit,
            remaining: self.remaining,
            reset_after_secs: self.reset_after_secs(now),
        }
    }
}

/// Values reported in the `RateLimit-*` response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_secs: u64,
}

impl RateLimitStatus {
    /// Standard headers only; legacy `X-RateLimit-*` are never sent
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static("ratelimit-limit"),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static("ratelimit-remaining"),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static("ratelimit-reset"),
            HeaderValue::from(self.reset_after_secs),
        );
    }
}

#[derive(Debug, Clone)]
pub enum Admission {
    Allowed(RateLimitResult),
    Limited(RateLimitResult),
    Skipped(SkipReason),
}

/// Limiter for one OAuth action
#[derive(Clone)]
pub struct RateLimiter {
    action: OAuthAction,
    rule: RateLimitRule,
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    bypass: Arc<BypassPolicy>,
}

impl RateLimiter {
    pub fn new(
        action: OAuthAction,
        rule: RateLimitRule,
        store: Arc<dyn GuardStore>,
        clock: Arc<dyn Clock>,
        bypass: Arc<BypassPolicy>,
    ) -> Self {
        Self {
            action,
            rule,
            store,
            clock,
            bypass,
        }
    }

    pub fn action(&self) -> OAuthAction {
        self.action
    }

    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// Count this request and decide admission. Increment and check are one
    /// store operation, so concurrent requests never undercount.
    pub async fn check(&self, ctx: &RequestContext) -> Result<Admission, StoreError> {
        if let Some(reason) = self.bypass.evaluate(ctx) {
            warn!(
                action = self.action.as_str(),
                reason = reason.as_str(),
                path = %ctx.path,
                ip = %ctx.client_ip,
                "Rate limit skipped"
            );
            return Ok(Admission::Skipped(reason));
        }

        let key = RateLimitKey::for_request(ctx).as_string(self.action);
        let count = self
            .store
            .increment_window(&key, self.rule.window(), self.clock.now())
            .await?;

        let limit = self.rule.max;
        let allowed = count.count <= u64::from(limit);
        let used = u32::try_from(count.count).unwrap_or(u32::MAX);
        let result = RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(used),
            resets_at: count.resets_at,
            key,
        };

        if allowed {
            debug!(key = %result.key, remaining = result.remaining, "Rate limit check passed");
            Ok(Admission::Allowed(result))
        } else {
            warn!(key = %result.key, limit, "Rate limit exceeded");
            Ok(Admission::Limited(result))
        }
    }
}

/// The three independently configured OAuth limiters
#[derive(Clone)]
pub struct RateLimiters {
    pub initiate: RateLimiter,
    pub callback: RateLimiter,
    pub refresh: RateLimiter,
}

impl RateLimiters {
    pub fn from_config(
        environment: Environment,
        config: &RateLimitConfig,
        store: Arc<dyn GuardStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bypass = Arc::new(BypassPolicy::from_config(environment, config));
        let build = |action, rule: &RateLimitRule| {
            RateLimiter::new(
                action,
                rule.clone(),
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&bypass),
            )
        };
        Self {
            initiate: build(OAuthAction::Initiate, &config.initiate),
            callback: build(OAuthAction::Callback, &config.callback),
            refresh: build(OAuthAction::Refresh, &config.refresh),
        }
    }

    pub fn for_action(&self, action: OAuthAction) -> &RateLimiter {
        match action {
            OAuthAction::Initiate => &self.initiate,
            OAuthAction::Callback => &self.callback,
            OAuthAction::Refresh => &self.refresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::guard::AuthUser;
    use crate::store::MemoryStore;
    use axum::http::{HeaderValue, Method};
    use chrono::Duration;

    fn limiter_with(
        config: &RateLimitConfig,
        environment: Environment,
    ) -> (RateLimiters, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiters = RateLimiters::from_config(
            environment,
            config,
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );
        (limiters, clock)
    }

    fn five_per_minute() -> RateLimitConfig {
        RateLimitConfig {
            initiate: RateLimitRule::new(60_000, 5, "Too many attempts"),
            ..RateLimitConfig::default()
        }
    }

    fn request_from(ip: &str) -> RequestContext {
        RequestContext::new(Method::GET, "/oauth/linkedin/initiate").with_client_ip(ip)
    }

    #[tokio::test]
    async fn admitted_status_counts_down() {
        let (limiters, clock) = limiter_with(&five_per_minute(), Environment::Production);
        let ctx = request_from("10.3.3.3");

        let Admission::Allowed(first) = limiters.initiate.check(&ctx).await.unwrap() else {
            panic!("first request should be admitted");
        };
        clock.advance(Duration::seconds(20));
        let Admission::Allowed(second) = limiters.initiate.check(&ctx).await.unwrap() else {
            panic!("second request should be admitted");
        };

        let status = second.status(clock.now());
        assert_eq!(first.remaining, 4);
        assert_eq!(
            status,
            RateLimitStatus {
                limit: 5,
                remaining: 3,
                reset_after_secs: 40,
            }
        );

        let mut headers = HeaderMap::new();
        status.apply(&mut headers);
        assert_eq!(headers["ratelimit-limit"], "5");
        assert_eq!(headers["ratelimit-remaining"], "3");
        assert_eq!(headers["ratelimit-reset"], "40");
        assert!(!headers.contains_key("x-ratelimit-remaining"));
    }

    #[test]
    fn key_prefers_user_identity() {
        let anonymous = request_from("10.1.1.1");
        assert_eq!(
            RateLimitKey::for_request(&anonymous).as_string(OAuthAction::Callback),
            "rl:callback:ip:10.1.1.1"
        );

        let authenticated = request_from("10.1.1.1").with_user(AuthUser::new("u42", None, "admin"));
        assert_eq!(
            RateLimitKey::for_request(&authenticated).as_string(OAuthAction::Refresh),
            "rl:refresh:user:u42"
        );
    }

    #[tokio::test]
    async fn sixth_request_in_window_is_limited_then_window_resets() {
        let (limiters, clock) = limiter_with(&five_per_minute(), Environment::Production);
        let ctx = request_from("203.0.113.9");

        for expected_remaining in (0..5).rev() {
            match limiters.initiate.check(&ctx).await.unwrap() {
                Admission::Allowed(result) => assert_eq!(result.remaining, expected_remaining),
                other => panic!("expected admission, got {:?}", other),
            }
        }

        match limiters.initiate.check(&ctx).await.unwrap() {
            Admission::Limited(result) => {
                assert!(!result.allowed);
                assert_eq!(result.remaining, 0);
                assert_eq!(result.reset_after_secs(clock.now()), 60);
            }
            other => panic!("expected limit, got {:?}", other),
        }

        clock.advance(Duration::milliseconds(60_001));
        assert!(matches!(
            limiters.initiate.check(&ctx).await.unwrap(),
            Admission::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn identities_and_actions_are_counted_separately() {
        let (limiters, _) = limiter_with(&five_per_minute(), Environment::Production);
        let a = request_from("10.0.0.1");
        let b = request_from("10.0.0.2");

        for _ in 0..5 {
            limiters.initiate.check(&a).await.unwrap();
        }
        assert!(matches!(
            limiters.initiate.check(&a).await.unwrap(),
            Admission::Limited(_)
        ));
        assert!(matches!(
            limiters.initiate.check(&b).await.unwrap(),
            Admission::Allowed(_)
        ));
        assert!(matches!(
            limiters.callback.check(&a).await.unwrap(),
            Admission::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_never_exceed_max() {
        let (limiters, _) = limiter_with(&five_per_minute(), Environment::Production);
        let ctx = Arc::new(request_from("198.51.100.4"));

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiters.initiate.clone();
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move { limiter.check(&ctx).await.unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Admission::Allowed(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn debug_bypass_skips_everything() {
        let config = RateLimitConfig {
            debug_bypass: true,
            ..five_per_minute()
        };
        let (limiters, _) = limiter_with(&config, Environment::Production);
        let ctx = request_from("10.0.0.9");
        for _ in 0..20 {
            assert!(matches!(
                limiters.initiate.check(&ctx).await.unwrap(),
                Admission::Skipped(SkipReason::DebugBypass)
            ));
        }
    }

    #[tokio::test]
    async fn trusted_header_only_honoured_outside_production() {
        let config = RateLimitConfig {
            trusted_internal_header: Some("x-internal-request".to_string()),
            ..five_per_minute()
        };
        let mut ctx = request_from("10.0.0.3");
        ctx.headers
            .insert("x-internal-request", HeaderValue::from_static("1"));

        let (dev, _) = limiter_with(&config, Environment::Development);
        assert!(matches!(
            dev.initiate.check(&ctx).await.unwrap(),
            Admission::Skipped(SkipReason::TrustedInternalHeader)
        ));

        let (prod, _) = limiter_with(&config, Environment::Production);
        assert!(matches!(
            prod.initiate.check(&ctx).await.unwrap(),
            Admission::Allowed(_)
        ));
    }

    #[tokio::test]
    async fn debug_path_prefix_skips() {
        let (limiters, _) = limiter_with(&five_per_minute(), Environment::Production);
        let ctx = RequestContext::new(Method::GET, "/oauth/debug/state").with_client_ip("10.0.0.5");
        assert!(matches!(
            limiters.callback.check(&ctx).await.unwrap(),
            Admission::Skipped(SkipReason::DebugPath)
        ));
    }
}
