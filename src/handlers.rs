use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::AppState;
use crate::error::ErrorCode;
use crate::guard::{RequestContext, RouteClass, security_event};
use crate::security::csrf;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    /// Issue time in milliseconds; clients echo it in the timestamp header
    pub timestamp: i64,
}

/// Issue a fresh CSRF token bound to the caller's session secret
pub async fn csrf_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
) -> Response {
    let secret = match state.secrets.get_or_create(&ctx.session).await {
        Ok(secret) => secret,
        Err(e) => {
            error!(request_id = %ctx.request_id, error = %e, "CSRF token generation failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to generate CSRF token",
                    "code": ErrorCode::CsrfGenerationError,
                })),
            )
                .into_response();
        }
    };

    let token = csrf::generate(&secret);
    let body = CsrfTokenResponse {
        csrf_token: token.clone(),
        timestamp: state.clock.now().timestamp_millis(),
    };

    let mut response = Json(body).into_response();
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(state.config.csrf.header_name.as_bytes()),
        HeaderValue::from_str(&token),
    ) {
        response.headers_mut().insert(name, value);
    }
    response
}

pub async fn list_posts() -> impl IntoResponse {
    Json(json!({ "posts": [] }))
}

/// Representative cookie-session form action behind the CSRF guard
pub async fn create_post(Extension(ctx): Extension<Arc<RequestContext>>) -> impl IntoResponse {
    info!(request_id = %ctx.request_id, "Post accepted");
    Json(json!({ "status": "accepted" }))
}

fn audit_success(state: &AppState, ctx: &RequestContext, route: RouteClass) {
    state
        .audit
        .dispatch(security_event(ctx, route.audit_action(), true));
}

/// Provider redirect construction lives with the platform integrations;
/// this endpoint only acknowledges a guarded initiation.
pub async fn oauth_initiate(
    State(state): State<AppState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    audit_success(&state, &ctx, RouteClass::OAuthInitiate);

    let base = state
        .config
        .oauth
        .redirect_base_url
        .as_deref()
        .unwrap_or_default()
        .trim_end_matches('/');
    Json(json!({
        "status": "initiated",
        "platform": platform,
        "redirectUri": format!("{}/oauth/{}/callback", base, platform),
    }))
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    audit_success(&state, &ctx, RouteClass::OAuthCallback);
    Json(json!({ "status": "connected", "platform": platform }))
}

pub async fn oauth_refresh(
    State(state): State<AppState>,
    Extension(ctx): Extension<Arc<RequestContext>>,
    Path(platform): Path<String>,
) -> impl IntoResponse {
    audit_success(&state, &ctx, RouteClass::OAuthRefresh);
    Json(json!({ "status": "refreshed", "platform": platform }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let environment = state.config.environment.as_str();

    if let Some(pg) = &state.database
        && let Err(e) = pg.health_check().await
    {
        error!(error = %e, "Health check failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "environment": environment })),
        )
            .into_response();
    }

    Json(json!({ "status": "ok", "environment": environment })).into_response()
}
