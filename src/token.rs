//! Session identifiers and Digest challenge tokens
//!
//! Session IDs are random alphanumeric strings. Digest nonces are signed with
//! HMAC-SHA256 so the engine can recognise the nonces it issued.

use hmac::{Hmac, Mac};
use rand::distr::{Alphanumeric, SampleString};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated session ID
pub const SESSION_ID_LENGTH: usize = 32;

/// Generate a random session ID drawn from `[0-9A-Za-z]`
pub fn generate_session_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SESSION_ID_LENGTH)
}

/// Check that a caller-supplied session ID only uses the ID alphabet
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Generate a Digest nonce for the given issue time
///
/// Format: `<unix-seconds>-<hex hmac>`
pub fn generate_nonce(secret: &str, issued_at: i64) -> String {
    format!("{issued_at}-{}", sign(secret, &issued_at.to_string()))
}

/// Verify a nonce was issued by us and is younger than `max_age` seconds
pub fn verify_nonce(nonce: &str, secret: &str, now: i64, max_age: i64) -> bool {
    let Some((ts, signature)) = nonce.split_once('-') else {
        return false;
    };
    let Ok(issued_at) = ts.parse::<i64>() else {
        return false;
    };

    if issued_at > now || now - issued_at > max_age {
        return false;
    }

    constant_time_eq(&sign(secret, ts), signature)
}

/// Opaque value sent with Digest challenges, stable per realm
pub fn generate_opaque(realm: &str) -> String {
    hex::encode(Sha256::digest(realm.as_bytes()))
}

fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

// ============================================================================
// TESTS
// ============================================================================
