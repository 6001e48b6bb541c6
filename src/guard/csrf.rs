// CSRF guard stage
// MethodCheck -> AuthBypassCheck -> TokenExtract -> TokenVerify -> Accept|Reject

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{GuardStage, RequestContext, Verdict};
use crate::clock::Clock;
use crate::config::CsrfConfig;
use crate::error::{CsrfFailure, GuardError};
use crate::security::{SecretManager, csrf};

pub struct CsrfStage {
    config: CsrfConfig,
    secrets: SecretManager,
    clock: Arc<dyn Clock>,
}

impl CsrfStage {
    pub fn new(config: CsrfConfig, secrets: SecretManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            secrets,
            clock,
        }
    }

    /// Cookie-less API calls carrying a bearer credential are not CSRF targets
    fn is_bearer_api_request(&self, ctx: &RequestContext) -> bool {
        ctx.bearer_token_present && ctx.path.starts_with(self.config.api_prefix.as_str())
    }

    async fn check(&self, ctx: &RequestContext) -> Result<(), GuardError> {
        if self.config.is_ignored_method(ctx.method.as_str()) {
            return Ok(());
        }
        if self.is_bearer_api_request(ctx) {
            debug!(path = %ctx.path, "CSRF skipped for bearer-authenticated API request");
            return Ok(());
        }

        let header_token = ctx
            .header(&self.config.header_name)
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let body_token = ctx
            .body_field(&self.config.body_field)
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let token = header_token.or(body_token).ok_or(GuardError::CsrfMissing)?;

        let secret = self.secrets.get_or_create(&ctx.session).await?;

        if !csrf::verify(token, &secret) {
            return Err(GuardError::CsrfInvalid(CsrfFailure::Invalid));
        }

        if self.config.require_double_submit {
            match (header_token, body_token) {
                (Some(h), Some(b)) if csrf::constant_time_eq(h.as_bytes(), b.as_bytes()) => {}
                _ => return Err(GuardError::CsrfInvalid(CsrfFailure::DoubleSubmitMismatch)),
            }
        }

        // client-supplied, so only ever an extra signal on top of the HMAC
        if let Some(raw) = ctx.header(&self.config.timestamp_header) {
            let issued = raw
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or(GuardError::CsrfInvalid(CsrfFailure::Expired))?;
            if self.clock.now() - issued > self.config.max_age() {
                return Err(GuardError::CsrfInvalid(CsrfFailure::Expired));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl GuardStage for CsrfStage {
    fn name(&self) -> &'static str {
        "csrf"
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Verdict {
        self.check(ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::SessionId;
    use crate::store::{GuardStore, MemoryStore};
    use axum::http::Method;
    use chrono::Duration;

    struct Fixture {
        stage: CsrfStage,
        secrets: SecretManager,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: CsrfConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let secrets = SecretManager::new(store.clone(), clock.clone(), Duration::hours(24));
        Fixture {
            stage: CsrfStage::new(config, secrets.clone(), clock.clone()),
            secrets,
            store,
            clock,
        }
    }

    fn reject_of(verdict: Verdict) -> GuardError {
        match verdict {
            Verdict::Reject(err) => err,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    async fn valid_token(f: &Fixture, session: &SessionId) -> String {
        let secret = f.secrets.get_or_create(session).await.unwrap();
        csrf::generate(&secret)
    }

    #[tokio::test]
    async fn safe_methods_bypass_without_token() {
        let f = fixture(CsrfConfig::default());
        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let ctx = RequestContext::new(method, "/api/posts");
            assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));
        }
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn bearer_api_request_bypasses() {
        let f = fixture(CsrfConfig::default());
        let ctx = RequestContext::new(Method::POST, "/api/posts").with_bearer_token();
        assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));

        // bearer outside the API prefix still needs a token
        let ctx = RequestContext::new(Method::POST, "/dashboard/save").with_bearer_token();
        assert!(matches!(
            reject_of(f.stage.evaluate(&ctx).await),
            GuardError::CsrfMissing
        ));
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let f = fixture(CsrfConfig::default());
        let ctx = RequestContext::new(Method::POST, "/api/posts");
        let err = reject_of(f.stage.evaluate(&ctx).await);
        assert!(matches!(err, GuardError::CsrfMissing));
        assert_eq!(err.code(), Some(crate::error::ErrorCode::CsrfTokenMissing));
    }

    #[tokio::test]
    async fn empty_tokens_count_as_missing() {
        let f = fixture(CsrfConfig::default());
        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_header("x-csrf-token", "")
            .with_body_field("_csrf", "  ");
        assert!(matches!(
            reject_of(f.stage.evaluate(&ctx).await),
            GuardError::CsrfMissing
        ));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn empty_header_falls_back_to_body_field() {
        let f = fixture(CsrfConfig {
            require_double_submit: false,
            ..CsrfConfig::default()
        });
        let ctx = RequestContext::new(Method::POST, "/api/posts");
        let token = valid_token(&f, &ctx.session).await;
        let ctx = ctx
            .with_header("x-csrf-token", "")
            .with_body_field("_csrf", &token);
        assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));
    }

    #[tokio::test]
    async fn forged_token_creates_secret_then_fails() {
        let f = fixture(CsrfConfig::default());
        let session = SessionId::new("fresh-session");
        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", "abc123.deadbeef");

        let err = reject_of(f.stage.evaluate(&ctx).await);
        assert!(matches!(err, GuardError::CsrfInvalid(CsrfFailure::Invalid)));
        assert_eq!(
            f.store.keys_with_prefix("csrf:secret:"),
            vec!["csrf:secret:fresh-session".to_string()]
        );
    }

    #[tokio::test]
    async fn double_submit_accepts_matching_pair() {
        let f = fixture(CsrfConfig::default());
        let session = SessionId::new("s1");
        let token = valid_token(&f, &session).await;

        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", &token)
            .with_body_field("_csrf", token.clone());
        assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));
    }

    #[tokio::test]
    async fn double_submit_requires_both_copies() {
        let f = fixture(CsrfConfig::default());
        let session = SessionId::new("s2");
        let token = valid_token(&f, &session).await;
        let other = valid_token(&f, &session).await;

        let header_only = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session.clone())
            .with_header("x-csrf-token", &token);
        assert!(matches!(
            reject_of(f.stage.evaluate(&header_only).await),
            GuardError::CsrfInvalid(CsrfFailure::DoubleSubmitMismatch)
        ));

        let mismatched = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", &token)
            .with_body_field("_csrf", other);
        let err = reject_of(f.stage.evaluate(&mismatched).await);
        assert_eq!(err.to_string(), "Double-submit CSRF validation failed");
    }

    #[tokio::test]
    async fn body_field_alone_is_enough_without_double_submit() {
        let config = CsrfConfig {
            require_double_submit: false,
            ..CsrfConfig::default()
        };
        let f = fixture(config);
        let session = SessionId::new("s3");
        let token = valid_token(&f, &session).await;

        let ctx = RequestContext::new(Method::PUT, "/api/posts/1")
            .with_session(session)
            .with_body_field("_csrf", token);
        assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let f = fixture(CsrfConfig::enhanced());
        let session = SessionId::new("s4");
        let token = valid_token(&f, &session).await;
        let issued = f.clock.now().timestamp_millis();

        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", &token)
            .with_header("x-csrf-timestamp", &issued.to_string())
            .with_body_field("_csrf", token.clone());

        f.clock.advance(Duration::minutes(29));
        assert!(matches!(f.stage.evaluate(&ctx).await, Verdict::Continue));

        f.clock.advance(Duration::minutes(2));
        let err = reject_of(f.stage.evaluate(&ctx).await);
        assert_eq!(err.to_string(), "CSRF token expired");
    }

    #[tokio::test]
    async fn unparsable_timestamp_is_rejected() {
        let f = fixture(CsrfConfig::default());
        let session = SessionId::new("s5");
        let token = valid_token(&f, &session).await;

        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", &token)
            .with_header("x-csrf-timestamp", "yesterday")
            .with_body_field("_csrf", token.clone());
        assert!(matches!(
            reject_of(f.stage.evaluate(&ctx).await),
            GuardError::CsrfInvalid(CsrfFailure::Expired)
        ));
    }

    #[tokio::test]
    async fn token_from_another_session_is_invalid() {
        let f = fixture(CsrfConfig::default());
        let token = valid_token(&f, &SessionId::new("victim")).await;

        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(SessionId::new("attacker"))
            .with_header("x-csrf-token", &token)
            .with_body_field("_csrf", token.clone());
        assert!(matches!(
            reject_of(f.stage.evaluate(&ctx).await),
            GuardError::CsrfInvalid(CsrfFailure::Invalid)
        ));
    }

    #[tokio::test]
    async fn expired_secrets_are_purged_and_replaced() {
        let f = fixture(CsrfConfig::default());
        let session = SessionId::new("s6");
        let token = valid_token(&f, &session).await;

        f.clock.advance(Duration::hours(25));
        assert_eq!(f.store.purge_expired(f.clock.now()).await.unwrap(), 1);

        let ctx = RequestContext::new(Method::POST, "/api/posts")
            .with_session(session)
            .with_header("x-csrf-token", &token)
            .with_body_field("_csrf", token.clone());
        assert!(matches!(
            reject_of(f.stage.evaluate(&ctx).await),
            GuardError::CsrfInvalid(CsrfFailure::Invalid)
        ));
    }
}
