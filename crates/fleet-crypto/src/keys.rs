//! Public key encoding and normalization.
//!
//! Mates written against different crypto libraries send their public keys
//! either as the raw 32-byte curve point or wrapped in an X.509
//! SubjectPublicKeyInfo DER structure (44 bytes). Every key that enters the
//! protocol goes through [`normalize_public_key`] exactly once so the rest of
//! the code only ever sees the raw form.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Length of a raw Ed25519 or X25519 public key.
pub const RAW_KEY_LEN: usize = 32;

/// Length of the DER prefix in front of a 32-byte key in SPKI form.
pub const SPKI_HEADER_LEN: usize = 12;

/// `SEQUENCE { SEQUENCE { OID 1.3.101.112 } BIT STRING (33) }`
pub const ED25519_SPKI_HEADER: [u8; SPKI_HEADER_LEN] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// `SEQUENCE { SEQUENCE { OID 1.3.101.110 } BIT STRING (33) }`
pub const X25519_SPKI_HEADER: [u8; SPKI_HEADER_LEN] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// Error type for key decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("public key is not valid base64")]
    InvalidEncoding,
    #[error("invalid public key length: expected 32 or 44, got {0}")]
    InvalidLength(usize),
    #[error("unrecognized public key header")]
    UnknownHeader,
}

/// The two key families used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Long-term signing key
    Ed25519,
    /// Key agreement key
    X25519,
}

impl KeyKind {
    pub fn spki_header(self) -> &'static [u8; SPKI_HEADER_LEN] {
        match self {
            KeyKind::Ed25519 => &ED25519_SPKI_HEADER,
            KeyKind::X25519 => &X25519_SPKI_HEADER,
        }
    }
}

/// Reduce a public key in either accepted wire form to its raw 32 bytes.
pub fn normalize_public_key(bytes: &[u8]) -> Result<[u8; RAW_KEY_LEN], KeyError> {
    let raw = match bytes.len() {
        RAW_KEY_LEN => bytes,
        n if n == SPKI_HEADER_LEN + RAW_KEY_LEN => {
            let (header, key) = bytes.split_at(SPKI_HEADER_LEN);
            if header != ED25519_SPKI_HEADER && header != X25519_SPKI_HEADER {
                return Err(KeyError::UnknownHeader);
            }
            key
        }
        n => return Err(KeyError::InvalidLength(n)),
    };
    let mut out = [0u8; RAW_KEY_LEN];
    out.copy_from_slice(raw);
    Ok(out)
}

/// Base64-decode and normalize a public key received on the wire.
pub fn decode_public_key(encoded: &str) -> Result<[u8; RAW_KEY_LEN], KeyError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidEncoding)?;
    normalize_public_key(&bytes)
}

/// Base64 form of a raw public key, as sent to peers.
pub fn encode_public_key(key: &[u8; RAW_KEY_LEN]) -> String {
    STANDARD.encode(key)
}

/// Wrap a raw key in its SPKI DER encoding.
pub fn to_spki(kind: KeyKind, key: &[u8; RAW_KEY_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SPKI_HEADER_LEN + RAW_KEY_LEN);
    out.extend_from_slice(kind.spki_header());
    out.extend_from_slice(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_key_passes_through() {
        let key = [7u8; 32];
        assert_eq!(normalize_public_key(&key).unwrap(), key);
    }

    #[test]
    fn spki_header_is_stripped() {
        let key = [9u8; 32];
        for kind in [KeyKind::Ed25519, KeyKind::X25519] {
            let wrapped = to_spki(kind, &key);
            assert_eq!(wrapped.len(), 44);
            assert_eq!(normalize_public_key(&wrapped).unwrap(), key);
        }
    }

    #[test]
    fn foreign_header_rejected() {
        let mut wrapped = to_spki(KeyKind::Ed25519, &[1u8; 32]);
        wrapped[8] = 0x71; // Ed448 OID
        assert_eq!(normalize_public_key(&wrapped), Err(KeyError::UnknownHeader));
    }

    #[test]
    fn odd_lengths_rejected() {
        assert_eq!(normalize_public_key(&[0u8; 31]), Err(KeyError::InvalidLength(31)));
        assert_eq!(normalize_public_key(&[]), Err(KeyError::InvalidLength(0)));
    }

    #[test]
    fn decode_handles_both_forms() {
        let key = [0xabu8; 32];
        let raw_b64 = encode_public_key(&key);
        let spki_b64 = STANDARD.encode(to_spki(KeyKind::X25519, &key));

        assert_eq!(decode_public_key(&raw_b64).unwrap(), key);
        assert_eq!(decode_public_key(&spki_b64).unwrap(), key);
        assert_eq!(decode_public_key("not base64!"), Err(KeyError::InvalidEncoding));
    }
}
