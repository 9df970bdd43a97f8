use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 of `notification_url + body`.
pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    /// No usable signature was supplied. Policy decides whether this is fatal.
    Missing,
}

pub fn compute_signature(secret: &str, url: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(url.as_bytes());
    mac.update(body);
    Some(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Classify a delivery's signature. Never fails on malformed input.
pub fn check_signature(
    body: &[u8],
    signature: Option<&str>,
    secret: &str,
    url: &str,
) -> SignatureCheck {
    let signature = match signature.map(str::trim).filter(|sig| !sig.is_empty()) {
        Some(sig) => sig,
        None => return SignatureCheck::Missing,
    };
    if verify_signature(body, signature, secret, url) {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}

pub fn verify_signature(body: &[u8], signature: &str, secret: &str, url: &str) -> bool {
    let expected = match compute_signature(secret, url, body) {
        Some(expected) => expected,
        None => return false,
    };
    constant_time_eq(signature.as_bytes(), expected.as_bytes())
}

/// Byte equality whose running time depends only on the lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
