/// Authentication utilities for shared-secret validation
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// The header in which clients present the shared secret.
pub const CLIENT_KEY_HEADER: &str = "x-banter-key";

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on key validation.
#[derive(Clone)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// This is the point: use the subtle crate for comparisons
impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

/// The wrapped secret stays out of debug output.
impl std::fmt::Debug for ConstantTimeString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConstantTimeString([redacted])")
    }
}

/// Validates the secret presented in the request headers against the
/// configured one. The presented value is trimmed first; a missing or
/// non-UTF-8 header always fails.
pub fn validate_client_key(expected: &ConstantTimeString, headers: &HeaderMap) -> bool {
    headers
        .get(CLIENT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|presented| ConstantTimeString::from(presented.trim().to_string()))
        .is_some_and(|presented| presented == *expected)
}
