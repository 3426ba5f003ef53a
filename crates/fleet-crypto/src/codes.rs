//! Human-verifiable values: pairing code, key fingerprint, challenge nonce.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};

use crate::hash::{sha256, sha256_concat};

/// Random bytes in an authentication challenge.
pub const NONCE_LEN: usize = 32;

/// 6-digit pairing code shown to the operator and the Mate user.
///
/// code = be_u24(SHA-256(peer_pub_b64 || navigator_pub_b64)[0..3]) mod 10^6
///
/// Both keys are the base64 strings of the raw public keys, so a Mate can
/// compute the same digits from the `pairing_response` it receives.
pub fn pairing_code(peer_pub_b64: &str, navigator_pub_b64: &str) -> String {
    let h = sha256_concat(&[peer_pub_b64.as_bytes(), navigator_pub_b64.as_bytes()]);
    let n = u32::from_be_bytes([0, h[0], h[1], h[2]]) % 1_000_000;
    format!("{:06}", n)
}

/// Short colon-separated fingerprint of a public key, e.g. `3f2a:91c0:7be4`.
pub fn fingerprint(public_key: &[u8]) -> String {
    let h = sha256(public_key);
    h[..6]
        .chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fresh base64 challenge nonce from the OS random source.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}
