//! Envelope cipher.
//!
//! AES-256-GCM with a random 96-bit IV per message. The sealed form is
//! `iv(12) || ciphertext || tag(16)`; on the wire it travels base64 encoded.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Error type for envelope encryption.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKey(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid envelope: too short")]
    InvalidEnvelope,
    #[error("envelope is not valid base64")]
    InvalidEncoding,
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))
}

/// Encrypt under a fresh IV.
///
/// Returns: iv(12) || ciphertext+tag
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;
    let iv = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&iv, plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(IV_LEN + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt and authenticate in one step.
///
/// Expects: iv(12) || ciphertext+tag
pub fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = cipher_for(key)?;
    if sealed.len() < IV_LEN + TAG_LEN {
        return Err(CipherError::InvalidEnvelope);
    }
    let (iv, ct) = sealed.split_at(IV_LEN);
    cipher
        .decrypt(Nonce::from_slice(iv), ct)
        .map_err(|_| CipherError::DecryptionFailed)
}

/// [`seal`] and base64-encode, producing the envelope `payload` string.
pub fn seal_base64(key: &[u8], plaintext: &[u8]) -> Result<String, CipherError> {
    seal(key, plaintext).map(|sealed| STANDARD.encode(sealed))
}

/// Decode an envelope `payload` string and [`open`] it.
pub fn open_base64(key: &[u8], payload: &str) -> Result<Vec<u8>, CipherError> {
    let sealed = STANDARD
        .decode(payload.trim())
        .map_err(|_| CipherError::InvalidEncoding)?;
    open(key, &sealed)
}
