pub mod audit;
pub mod csrf;
pub mod headers;
pub mod rate_limiting;
pub mod replay;
pub mod secrets;

pub use audit::{AuditEvent, AuditPipeline, SecurityEvent};
pub use headers::{HeaderProfile, HeaderStep};
pub use rate_limiting::{
    Admission, BypassPolicy, OAuthAction, RateLimitKey, RateLimitResult, RateLimitStatus,
    RateLimiter, RateLimiters, SkipReason,
};
pub use replay::{ReplayError, ReplayGuard};
pub use secrets::{SecretError, SecretManager, SessionId, SessionSecret};
