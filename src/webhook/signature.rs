//! Webhook signature verification (`X-Hub-Signature-256`).
//!
//! Verification must run on the exact raw body bytes as received. Parsing
//! and re-serializing the JSON first changes key order and whitespace, and
//! the recomputed digest will never match.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify a `sha256=<hex>` signature against the raw request body.
///
/// Fails closed: an empty secret, a missing/unprefixed header value,
/// undecodable hex, and a digest length mismatch all return `false`. The
/// digest comparison itself is constant-time (`Mac::verify_slice`).
pub fn verify_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    if app_secret.is_empty() {
        return false;
    }

    let Some(hex_sig) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body. Used by tests and by
/// tooling that replays captured deliveries against a local gateway.
pub fn compute_signature(app_secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"stayflow").expect("hmac"));
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}
