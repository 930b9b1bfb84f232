//! Webhook payload signing and verification.
//!
//! Verification operates on the exact bytes received and fails closed: any
//! malformed signature, unknown scheme, or crypto error is an invalid
//! signature, never a panic or a propagated error.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

/// Sign a payload so a replayed copy passes verification on redelivery.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature header value against the raw request body.
///
/// Accepts `sha256=` signatures and the legacy `sha1=` scheme still sent by
/// older webhook senders.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    if body.is_empty() {
        return false;
    }
    let Some((scheme, hex_digest)) = signature.split_once('=') else {
        return false;
    };
    let Ok(digest) = hex::decode(hex_digest) else {
        return false;
    };
    match scheme {
        "sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .expect("HMAC can take key of any size");
            mac.update(body);
            mac.verify_slice(&digest).is_ok()
        }
        "sha1" => {
            let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
                .expect("HMAC can take key of any size");
            mac.update(body);
            mac.verify_slice(&digest).is_ok()
        }
        _ => false,
    }
}
