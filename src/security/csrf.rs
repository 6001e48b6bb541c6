// CSRF Token Service
// Stateless HMAC-based tokens of the form `nonce.hmac`, derived from the session secret

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::secrets::SessionSecret;

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '.';

/// Generate a token bound to `secret`.
///
/// Nothing is stored server-side: any token derived from the current secret
/// stays valid for the secret's whole lifetime.
pub fn generate(secret: &SessionSecret) -> String {
    let nonce_bytes: [u8; 16] = rand::random();
    let nonce = URL_SAFE_NO_PAD.encode(nonce_bytes);
    let mac = URL_SAFE_NO_PAD.encode(compute_hmac(secret, &nonce));
    format!("{}{}{}", nonce, SEPARATOR, mac)
}

/// Check a token against `secret`. Malformed input fails closed.
pub fn verify(token: &str, secret: &SessionSecret) -> bool {
    let Some((nonce, mac)) = token.split_once(SEPARATOR) else {
        debug!("CSRF token has no separator");
        return false;
    };
    if nonce.is_empty() || mac.is_empty() {
        return false;
    }
    let Ok(provided) = URL_SAFE_NO_PAD.decode(mac) else {
        debug!("CSRF token signature is not valid base64");
        return false;
    };

    let expected = compute_hmac(secret, nonce);
    constant_time_eq(&provided, &expected)
}

fn compute_hmac(secret: &SessionSecret, nonce: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(nonce.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    a.ct_eq(b).into()
}
