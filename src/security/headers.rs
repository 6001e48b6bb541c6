// Security Headers Composer
// Maps a route profile to the ordered header-setting steps applied to its responses

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};

/// CSP directive types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CspDirective {
    DefaultSrc,
    ScriptSrc,
    StyleSrc,
    ImgSrc,
    ConnectSrc,
    ObjectSrc,
    FrameAncestors,
    BaseUri,
    FormAction,
    Sandbox,
}

impl CspDirective {
    fn as_str(&self) -> &'static str {
        match self {
            CspDirective::DefaultSrc => "default-src",
            CspDirective::ScriptSrc => "script-src",
            CspDirective::StyleSrc => "style-src",
            CspDirective::ImgSrc => "img-src",
            CspDirective::ConnectSrc => "connect-src",
            CspDirective::ObjectSrc => "object-src",
            CspDirective::FrameAncestors => "frame-ancestors",
            CspDirective::BaseUri => "base-uri",
            CspDirective::FormAction => "form-action",
            CspDirective::Sandbox => "sandbox",
        }
    }
}

/// CSP source types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CspSource {
    None,
    Self_,
    UnsafeInline,
    Data,
}

impl CspSource {
    fn as_str(&self) -> &'static str {
        match self {
            CspSource::None => "'none'",
            CspSource::Self_ => "'self'",
            CspSource::UnsafeInline => "'unsafe-inline'",
            CspSource::Data => "data:",
        }
    }
}

/// Ordered CSP policy; directives render in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CspPolicy {
    directives: Vec<(CspDirective, Vec<CspSource>)>,
}

impl CspPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directive(mut self, directive: CspDirective, sources: &[CspSource]) -> Self {
        self.directives.push((directive, sources.to_vec()));
        self
    }

    /// Generate the CSP header value
    pub fn to_header_value(&self) -> String {
        self.directives
            .iter()
            .map(|(directive, sources)| {
                if sources.is_empty() {
                    directive.as_str().to_string()
                } else {
                    let sources: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
                    format!("{} {}", directive.as_str(), sources.join(" "))
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Locked-down policy for JSON endpoints
    pub fn api() -> Self {
        Self::new()
            .directive(CspDirective::DefaultSrc, &[CspSource::None])
            .directive(CspDirective::FrameAncestors, &[CspSource::None])
    }

    /// Uploaded content must never execute
    pub fn upload() -> Self {
        Self::new()
            .directive(CspDirective::DefaultSrc, &[CspSource::None])
            .directive(CspDirective::Sandbox, &[])
            .directive(CspDirective::FrameAncestors, &[CspSource::None])
    }

    /// Dashboard pages
    pub fn public() -> Self {
        Self::new()
            .directive(CspDirective::DefaultSrc, &[CspSource::Self_])
            .directive(CspDirective::ScriptSrc, &[CspSource::Self_])
            .directive(
                CspDirective::StyleSrc,
                &[CspSource::Self_, CspSource::UnsafeInline],
            )
            .directive(CspDirective::ImgSrc, &[CspSource::Self_, CspSource::Data])
            .directive(CspDirective::ConnectSrc, &[CspSource::Self_])
            .directive(CspDirective::ObjectSrc, &[CspSource::None])
            .directive(CspDirective::BaseUri, &[CspSource::Self_])
            .directive(CspDirective::FormAction, &[CspSource::Self_])
            .directive(CspDirective::FrameAncestors, &[CspSource::Self_])
    }
}

/// Route profile used to pick response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProfile {
    Api,
    Upload,
    Websocket,
    Public,
}

impl HeaderProfile {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with("/api/upload") {
            HeaderProfile::Upload
        } else if path == "/ws" || path.starts_with("/ws/") {
            HeaderProfile::Websocket
        } else if path.starts_with("/api/") || path.starts_with("/oauth/") {
            HeaderProfile::Api
        } else {
            HeaderProfile::Public
        }
    }
}

/// A single header-setting step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStep {
    ContentSecurityPolicy(CspPolicy),
    FrameOptions(&'static str),
    NoSniff,
    CacheControl(&'static str),
}

impl HeaderStep {
    pub fn header(&self) -> (HeaderName, HeaderValue) {
        match self {
            HeaderStep::ContentSecurityPolicy(policy) => (
                header::CONTENT_SECURITY_POLICY,
                HeaderValue::from_str(&policy.to_header_value())
                    .unwrap_or_else(|_| HeaderValue::from_static("default-src 'none'")),
            ),
            HeaderStep::FrameOptions(value) => {
                (header::X_FRAME_OPTIONS, HeaderValue::from_static(*value))
            }
            HeaderStep::NoSniff => (
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ),
            HeaderStep::CacheControl(value) => {
                (header::CACHE_CONTROL, HeaderValue::from_static(*value))
            }
        }
    }
}

/// Ordered steps for a profile
pub fn compose(profile: HeaderProfile) -> Vec<HeaderStep> {
    match profile {
        HeaderProfile::Api => vec![
            HeaderStep::ContentSecurityPolicy(CspPolicy::api()),
            HeaderStep::FrameOptions("DENY"),
            HeaderStep::NoSniff,
            HeaderStep::CacheControl("no-store"),
        ],
        HeaderProfile::Upload => vec![
            HeaderStep::ContentSecurityPolicy(CspPolicy::upload()),
            HeaderStep::FrameOptions("DENY"),
            HeaderStep::NoSniff,
            HeaderStep::CacheControl("no-store, private"),
        ],
        // Upgrade responses carry no document, only sniffing and caching matter
        HeaderProfile::Websocket => vec![
            HeaderStep::NoSniff,
            HeaderStep::CacheControl("no-store"),
        ],
        HeaderProfile::Public => vec![
            HeaderStep::ContentSecurityPolicy(CspPolicy::public()),
            HeaderStep::FrameOptions("SAMEORIGIN"),
            HeaderStep::NoSniff,
            HeaderStep::CacheControl("no-cache"),
        ],
    }
}

/// Apply every step for `profile`, later steps overwriting earlier ones
pub fn apply(profile: HeaderProfile, headers: &mut HeaderMap) {
    for step in compose(profile) {
        let (name, value) = step.header();
        headers.insert(name, value);
    }
}
