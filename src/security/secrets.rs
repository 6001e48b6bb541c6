// Session Secret Manager
// Owns the lifecycle of the per-session secret that CSRF tokens are derived from

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::store::{GuardStore, StoreError};

const SECRET_KEY_PREFIX: &str = "csrf:secret:";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("session store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

/// Opaque session identifier carried in the session cookie
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh random session id
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(random_bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // enough to correlate logs without exposing the cookie value
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionId({}…)", prefix)
    }
}

/// Per-session random secret. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 256 bits from the OS-seeded thread RNG
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(random_bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(<redacted>)")
    }
}

#[derive(Clone)]
pub struct SecretManager {
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
}

impl SecretManager {
    pub fn new(store: Arc<dyn GuardStore>, clock: Arc<dyn Clock>, session_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            session_ttl,
        }
    }

    /// Return the session's secret, creating it on first use.
    ///
    /// Concurrent first requests for the same session all observe the one
    /// secret that won the insert.
    pub async fn get_or_create(&self, session: &SessionId) -> Result<SessionSecret, SecretError> {
        let key = format!("{}{}", SECRET_KEY_PREFIX, session.as_str());
        let candidate = SessionSecret::generate();

        let stored = self
            .store
            .get_or_insert(&key, &candidate.0, self.session_ttl, self.clock.now())
            .await
            .map_err(|e| {
                error!(session = ?session, error = %e, "Failed to load session secret");
                SecretError::StoreUnavailable(e)
            })?;

        if stored == candidate.0 {
            debug!(session = ?session, "Created session secret");
        }
        Ok(SessionSecret(stored))
    }
}
