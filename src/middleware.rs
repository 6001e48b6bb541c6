use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error, warn};

use crate::AppState;
use crate::error::GuardError;
use crate::guard::{RequestContext, RouteClass};
use crate::security::headers::{self, HeaderProfile};

/// Global counter for generating request IDs
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest body buffered for CSRF body-field extraction
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Type for storing request ID in request extensions
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Middleware that assigns a request ID, reusing an inbound `x-request-id`
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = extract_or_generate_request_id(request.headers());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), header_value);
    }

    debug!("Request {} processed", request_id);
    response
}

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    format!("req_{}_{}", timestamp, counter)
}

/// Extract request ID from request headers or generate a new one
pub fn extract_or_generate_request_id(headers: &HeaderMap) -> String {
    if let Some(request_id) = headers.get(REQUEST_ID_HEADER)
        && let Ok(id) = request_id.to_str()
        && !id.is_empty()
    {
        return id.to_string();
    }

    generate_request_id()
}

/// Buffer the body, build the [`RequestContext`] once and hand it to the
/// guards and handlers through request extensions. Mints the session cookie
/// when the caller had none.
pub async fn context_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, path = %parts.uri.path(), "Request body rejected");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let csrf = &state.config.csrf;
    let ctx = Arc::new(RequestContext::from_parts(
        &parts,
        &bytes,
        &csrf.session_cookie,
        &state.config.server.trusted_proxies,
    ));
    parts.extensions.insert(Arc::clone(&ctx));

    let mut response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    if ctx.session_is_new {
        let secure = if state.config.environment.is_production() {
            "; Secure"
        } else {
            ""
        };
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{}",
            csrf.session_cookie,
            ctx.session.as_str(),
            csrf.session_ttl_secs,
            secure
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

/// Run the guard pipeline of one route class before the handler
pub async fn guard_middleware(
    State((state, route)): State<(AppState, RouteClass)>,
    request: Request,
    next: Next,
) -> Response {
    let environment = state.config.environment;
    let Some(ctx) = request.extensions().get::<Arc<RequestContext>>().cloned() else {
        error!(route = ?route, "Request context missing; context middleware not installed");
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        return GuardError::Internal("request context unavailable".to_string())
            .into_response(environment, &request_id);
    };

    match state.guards.for_route(route).run(&ctx).await {
        Ok(clearance) => {
            let mut response = next.run(request).await;
            clearance.apply(response.headers_mut());
            response
        }
        Err(err) => err.into_response(environment, &ctx.request_id),
    }
}

/// Apply the header profile for the request path to every response
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let profile = HeaderProfile::for_path(request.uri().path());
    let mut response = next.run(request).await;
    headers::apply(profile, response.headers_mut());
    response
}
