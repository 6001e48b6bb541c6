use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use serde::{Deserialize, Serialize};

use crate::middleware::{RequestId, generate_request_id};
use crate::security::SessionId;

/// Authenticated caller, placed in request extensions by the upstream
/// authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub role: String,
}

impl AuthUser {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: Option<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id,
            role: role.into(),
        }
    }
}

/// Everything a guard stage may look at, built once per request and shared
/// read-only by every stage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub session: SessionId,
    /// The session id was minted for this request and must be set as a cookie
    pub session_is_new: bool,
    pub bearer_token_present: bool,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub origin: Option<String>,
    pub user: Option<AuthUser>,
    /// `{platform}` segment of `/oauth/{platform}/...` paths
    pub platform: Option<String>,
    pub query: HashMap<String, String>,
    pub body_fields: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            request_id: generate_request_id(),
            method,
            platform: platform_from_path(&path),
            path,
            session: SessionId::generate(),
            session_is_new: true,
            bearer_token_present: false,
            client_ip: "unknown".to_string(),
            user_agent: None,
            origin: None,
            user: None,
            query: HashMap::new(),
            body_fields: HashMap::new(),
            headers: HeaderMap::new(),
        }
    }

    /// Build from the request head and the buffered body. Forwarding headers
    /// are only read when the socket peer is one of `trusted_proxies`.
    pub fn from_parts(
        parts: &Parts,
        body: &[u8],
        session_cookie: &str,
        trusted_proxies: &[IpAddr],
    ) -> Self {
        let headers = parts.headers.clone();
        let path = parts.uri.path().to_string();

        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(generate_request_id);

        let (session, session_is_new) = match cookie_value(&headers, session_cookie) {
            Some(value) if !value.is_empty() => (SessionId::new(value), false),
            _ => (SessionId::generate(), true),
        };

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        let query = parts
            .uri
            .query()
            .map(parse_urlencoded)
            .unwrap_or_default();

        Self {
            request_id,
            method: parts.method.clone(),
            platform: platform_from_path(&path),
            path,
            session,
            session_is_new,
            bearer_token_present: has_bearer_token(&headers),
            client_ip: resolve_client_ip(&headers, peer, trusted_proxies),
            user_agent: header_str(&headers, header::USER_AGENT.as_str()),
            origin: header_str(&headers, header::ORIGIN.as_str()),
            user: parts.extensions.get::<AuthUser>().cloned(),
            query,
            body_fields: parse_body(&headers, body),
            headers,
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = ip.into();
        self
    }

    pub fn with_user(mut self, user: AuthUser) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self.session_is_new = false;
        self
    }

    pub fn with_bearer_token(mut self) -> Self {
        self.bearer_token_present = true;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.body_fields.insert(key.into(), value.into());
        self
    }

    /// Invalid names or values are ignored
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_field(&self, name: &str) -> Option<&str> {
        self.body_fields.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn has_bearer_token(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.get(..7))
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "))
}

/// The socket peer, unless the peer is a trusted proxy. Behind a trusted
/// proxy the caller is the right-most `X-Forwarded-For` hop that is not
/// itself trusted, falling back to `X-Real-IP` and then the peer.
fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted_proxies: &[IpAddr],
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();

    for hop in hops.iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) if trusted_proxies.contains(&ip) => continue,
            Ok(ip) => return ip.to_string(),
            // anything left of a malformed hop is unverifiable
            Err(_) => return peer.to_string(),
        }
    }

    if hops.is_empty()
        && let Some(real_ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return real_ip.to_string();
    }

    peer.to_string()
}

fn platform_from_path(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some("oauth"), Some(platform), Some(_)) if !platform.is_empty() => {
            Some(platform.to_string())
        }
        _ => None,
    }
}

fn parse_urlencoded(input: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(input)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

/// Form and JSON-object bodies; string and scalar values only
fn parse_body(headers: &HeaderMap, body: &[u8]) -> HashMap<String, String> {
    if body.is_empty() {
        return HashMap::new();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/x-www-form-urlencoded") {
        return std::str::from_utf8(body)
            .map(parse_urlencoded)
            .unwrap_or_default();
    }

    if content_type.starts_with("application/json") {
        let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) else {
            return HashMap::new();
        };
        return map
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(s) => Some((key, s)),
                serde_json::Value::Number(n) => Some((key, n.to_string())),
                serde_json::Value::Bool(b) => Some((key, b.to_string())),
                _ => None,
            })
            .collect();
    }

    HashMap::new()
}
