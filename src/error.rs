use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::config::Environment;
use crate::security::{RateLimitStatus, ReplayError, SecretError};
use crate::store::StoreError;

/// Machine-readable codes carried by CSRF responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CsrfTokenMissing,
    CsrfTokenInvalid,
    CsrfGenerationError,
}

/// Error classification, one HTTP status family per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Replay,
    RateLimited,
    Internal,
}

/// Reasons a present CSRF token is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfFailure {
    Invalid,
    DoubleSubmitMismatch,
    Expired,
}

impl CsrfFailure {
    pub fn message(&self) -> &'static str {
        match self {
            CsrfFailure::Invalid => "Invalid CSRF token",
            CsrfFailure::DoubleSubmitMismatch => "Double-submit CSRF validation failed",
            CsrfFailure::Expired => "CSRF token expired",
        }
    }
}

/// Rejection raised by a guard stage
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("CSRF token missing")]
    CsrfMissing,

    #[error("{}", .0.message())]
    CsrfInvalid(CsrfFailure),

    #[error("{message}")]
    Validation {
        message: String,
        platform: Option<String>,
        allowed_platforms: Option<Vec<String>>,
    },

    #[error("{0}")]
    Authorization(String),

    #[error("OAuth state parameter has already been used")]
    Replay,

    #[error("{message}")]
    RateLimited {
        message: String,
        limit: u32,
        reset_after_secs: u64,
    },

    /// Detail is logged and shown only in development; never secret material
    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    pub fn validation(message: impl Into<String>) -> Self {
        GuardError::Validation {
            message: message.into(),
            platform: None,
            allowed_platforms: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::CsrfMissing | GuardError::CsrfInvalid(_) | GuardError::Validation { .. } => {
                ErrorKind::Validation
            }
            GuardError::Authorization(_) => ErrorKind::Authorization,
            GuardError::Replay => ErrorKind::Replay,
            GuardError::RateLimited { .. } => ErrorKind::RateLimited,
            GuardError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GuardError::CsrfMissing | GuardError::CsrfInvalid(_) => StatusCode::UNAUTHORIZED,
            GuardError::Validation { .. } | GuardError::Replay => StatusCode::BAD_REQUEST,
            GuardError::Authorization(_) => StatusCode::FORBIDDEN,
            GuardError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GuardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            GuardError::CsrfMissing => Some(ErrorCode::CsrfTokenMissing),
            GuardError::CsrfInvalid(_) => Some(ErrorCode::CsrfTokenInvalid),
            _ => None,
        }
    }

    /// Message shown to the caller
    pub fn public_message(&self, environment: Environment) -> String {
        match self {
            GuardError::Internal(detail) if !environment.is_production() => {
                format!("Internal server error: {}", detail)
            }
            GuardError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_body(&self, environment: Environment, request_id: &str) -> RejectionBody {
        let (platform, allowed_platforms) = match self {
            GuardError::Validation {
                platform,
                allowed_platforms,
                ..
            } => (platform.clone(), allowed_platforms.clone()),
            _ => (None, None),
        };
        RejectionBody {
            error: self.public_message(environment),
            code: self.code(),
            platform,
            allowed_platforms,
            request_id: matches!(self, GuardError::Internal(_)).then(|| request_id.to_string()),
        }
    }

    pub fn into_response(self, environment: Environment, request_id: &str) -> Response {
        let body = self.to_body(environment, request_id);
        let mut response = (self.status_code(), Json(body)).into_response();

        if let GuardError::RateLimited {
            limit,
            reset_after_secs,
            ..
        } = &self
        {
            let headers = response.headers_mut();
            RateLimitStatus {
                limit: *limit,
                remaining: 0,
                reset_after_secs: *reset_after_secs,
            }
            .apply(headers);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(*reset_after_secs));
        }

        response
    }
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        GuardError::Internal(err.to_string())
    }
}

impl From<SecretError> for GuardError {
    fn from(err: SecretError) -> Self {
        GuardError::Internal(err.to_string())
    }
}

impl From<ReplayError> for GuardError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::Reused => GuardError::Replay,
            ReplayError::Store(e) => GuardError::Internal(e.to_string()),
        }
    }
}

/// JSON body of every guard rejection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_platforms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}
