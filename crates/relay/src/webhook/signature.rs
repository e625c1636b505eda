//! Webhook payload signing.
//!
//! Signatures are HMAC-SHA256 over the exact serialized body bytes,
//! transmitted out-of-band in a header. Kept as pure functions so the
//! scheme is testable without any HTTP transport, and so receivers can
//! reuse `verify` verbatim.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";
/// Header carrying the send timestamp (unix seconds).
pub const TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";

/// Compute the signature for a body: `sha256=<hex digest>`.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take a key of any size so this cannot fail");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature produced by [`sign`], in constant time.
pub fn verify(body: &[u8], secret: &str, signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
