use std::sync::Arc;

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{GuardStore, StoreError};

const STATE_KEY_PREFIX: &str = "oauth:state:";

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("OAuth state parameter has already been used")]
    Reused,

    #[error("replay store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// One-time consumption of OAuth state values.
///
/// A state moves from unused to consumed exactly once; the check and the
/// insert are one atomic store operation, so concurrent callbacks carrying
/// the same state see exactly one winner.
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn GuardStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub async fn consume(&self, state: &str) -> Result<(), ReplayError> {
        let key = state_key(state);
        let now = self.clock.now();

        let inserted = self
            .store
            .insert_if_absent(&key, &now.to_rfc3339(), self.ttl, now)
            .await?;

        if inserted {
            debug!("OAuth state consumed");
            Ok(())
        } else {
            warn!(state_key = %key, "OAuth state replay rejected");
            Err(ReplayError::Reused)
        }
    }
}

/// Raw state values are hashed so the store never holds them verbatim
fn state_key(state: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(state.as_bytes());
    format!("{}{:x}", STATE_KEY_PREFIX, hasher.finalize())
}
