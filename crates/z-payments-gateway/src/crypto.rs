//! Request signing and callback verification.
//!
//! Every direct request and every callback carries a `MAC` field: the
//! HMAC-SHA256 of the canonical field string, keyed with the merchant's
//! shared secret. The canonical string is every other field sorted by name,
//! form-encoded and joined as `NAME=value&NAME=value`. Encoding keeps a `&`
//! or `=` inside a value from reading as a field boundary.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::fields::MAC;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return hex-encoded result.
///
/// # Panics
///
/// This function will never panic in practice. The `expect` call is guarded by
/// the invariant that HMAC-SHA256 accepts keys of any size per RFC 2104.
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    // INVARIANT: HMAC-SHA256 accepts keys of any size per RFC 2104.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC-SHA256 accepts any key size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// The canonical string a `MAC` is computed over.
#[must_use]
pub fn canonical_string(fields: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields.iter().filter(|(name, _)| name.as_str() != MAC))
        .finish()
}

/// Compute the `MAC` of a field set.
#[must_use]
pub fn sign_fields(secret: &str, fields: &BTreeMap<String, String>) -> String {
    hmac_sha256_hex(secret, &canonical_string(fields))
}

/// Check the `MAC` carried inside a field set.
#[must_use]
pub fn verify_fields(secret: &str, fields: &BTreeMap<String, String>) -> bool {
    fields
        .get(MAC)
        .is_some_and(|mac| constant_time_eq(&sign_fields(secret, fields), &mac.to_ascii_lowercase()))
}
