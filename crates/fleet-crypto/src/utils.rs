//! Constant-time comparison helpers.
//!
//! Challenge nonces and stored public keys are compared with these so the
//! comparison time does not reveal how many leading bytes matched.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// ```rust
/// use fleet_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(b"nonce", b"nonce"));
/// assert!(!constant_time_compare(b"nonce", b"nonc3"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// String form of [`constant_time_compare`].
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
