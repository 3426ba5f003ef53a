//! Long-term Navigator identity.
//!
//! Holds the Ed25519 signing key and the X25519 key agreement key. Both
//! dalek key types wipe themselves on drop, so the struct needs no manual
//! zeroization; secret bytes handed out for persistence are wrapped in
//! [`Zeroizing`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::hash::sha256;
use crate::keys::{decode_public_key, encode_public_key, normalize_public_key, KeyError};

/// Error type for identity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid signature length: expected 64, got {0}")]
    InvalidSignatureLength(usize),
    #[error("signature is not valid base64")]
    InvalidSignatureEncoding,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("key agreement produced a non-contributory secret")]
    NonContributory,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The Navigator's signing and key agreement keypairs.
pub struct Identity {
    sign_key: SigningKey,
    kex_key: StaticSecret,
}

impl Identity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Self {
        let sign_key = SigningKey::generate(&mut OsRng);
        let kex_key = StaticSecret::random_from_rng(OsRng);
        Self { sign_key, kex_key }
    }

    /// Rebuild an identity from persisted secret bytes.
    ///
    /// # Arguments
    /// * `sign_seed` - 32-byte Ed25519 private key seed
    /// * `kex_secret` - 32-byte X25519 private key
    pub fn from_bytes(sign_seed: &[u8; 32], kex_secret: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(sign_seed),
            kex_key: StaticSecret::from(*kex_secret),
        }
    }

    pub fn sign_seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.sign_key.to_bytes())
    }

    pub fn kex_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.kex_key.to_bytes())
    }

    /// Raw Ed25519 public key.
    pub fn sign_pub(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    /// Raw X25519 public key.
    pub fn kex_pub(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.kex_key).as_bytes()
    }

    /// Signing public key in the base64 form sent to peers.
    pub fn sign_pub_b64(&self) -> String {
        encode_public_key(&self.sign_pub())
    }

    /// Exchange public key in the base64 form sent to peers.
    pub fn kex_pub_b64(&self) -> String {
        encode_public_key(&self.kex_pub())
    }

    /// Sign a message using Ed25519.
    ///
    /// Returns a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// Derive the symmetric session key shared with a peer.
    ///
    /// key = SHA-256(X25519(our_secret, peer_public)). The peer key may be
    /// raw or SPKI encoded.
    pub fn derive_shared_secret(&self, peer_kex_pub: &[u8]) -> Result<[u8; 32], IdentityError> {
        let peer = X25519PublicKey::from(normalize_public_key(peer_kex_pub)?);
        let shared = self.kex_key.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(IdentityError::NonContributory);
        }
        Ok(sha256(shared.as_bytes()))
    }

    /// [`Identity::derive_shared_secret`] for a base64 peer key.
    pub fn derive_shared_secret_b64(&self, peer_kex_pub: &str) -> Result<[u8; 32], IdentityError> {
        let peer = decode_public_key(peer_kex_pub)?;
        self.derive_shared_secret(&peer)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("sign_pub", &self.sign_pub_b64())
            .field("kex_pub", &self.kex_pub_b64())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature.
///
/// # Arguments
/// * `pub_key` - The signer's public key, raw (32 bytes) or SPKI (44 bytes)
/// * `message` - The message that was signed
/// * `signature` - The 64-byte Ed25519 signature
pub fn verify_signature(
    pub_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let raw = normalize_public_key(pub_key)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| IdentityError::InvalidSignatureLength(signature.len()))?;
    let verifying_key =
        VerifyingKey::from_bytes(&raw).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Verify a base64 signature against a base64 public key.
pub fn verify_signature_b64(
    pub_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), IdentityError> {
    let key = decode_public_key(pub_key)?;
    let sig = STANDARD
        .decode(signature.trim())
        .map_err(|_| IdentityError::InvalidSignatureEncoding)?;
    verify_signature(&key, message, &sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{to_spki, KeyKind};

    #[test]
    fn test_signature_round_trip() {
        let identity = Identity::generate();
        let message = b"os-laptop:bm9uY2U=";

        let signature = identity.sign(message);
        assert!(verify_signature(&identity.sign_pub(), message, &signature).is_ok());
    }

    #[test]
    fn test_signature_accepts_spki_key() {
        let identity = Identity::generate();
        let message = b"mail-inbox:abc";
        let signature = identity.sign(message);
        let spki = to_spki(KeyKind::Ed25519, &identity.sign_pub());

        assert!(verify_signature(&spki, message, &signature).is_ok());
    }

    #[test]
    fn test_signature_wrong_message_fails() {
        let identity = Identity::generate();
        let signature = identity.sign(b"Original message");

        assert_eq!(
            verify_signature(&identity.sign_pub(), b"Tampered message", &signature),
            Err(IdentityError::InvalidSignature)
        );
    }

    #[test]
    fn test_signature_wrong_key_fails() {
        let identity1 = Identity::generate();
        let identity2 = Identity::generate();
        let signature = identity1.sign(b"Test message");

        assert!(verify_signature(&identity2.sign_pub(), b"Test message", &signature).is_err());
    }

    #[test]
    fn test_short_signature_rejected() {
        let identity = Identity::generate();
        assert_eq!(
            verify_signature(&identity.sign_pub(), b"m", &[0u8; 63]),
            Err(IdentityError::InvalidSignatureLength(63))
        );
    }

    #[test]
    fn test_b64_verification() {
        let identity = Identity::generate();
        let signature = STANDARD.encode(identity.sign(b"hello"));

        assert!(verify_signature_b64(&identity.sign_pub_b64(), b"hello", &signature).is_ok());
        assert_eq!(
            verify_signature_b64(&identity.sign_pub_b64(), b"hello", "%%%"),
            Err(IdentityError::InvalidSignatureEncoding)
        );
    }

    #[test]
    fn test_shared_secret_symmetry() {
        let navigator = Identity::generate();
        let mate = Identity::generate();

        let a = navigator.derive_shared_secret(&mate.kex_pub()).unwrap();
        let b = mate.derive_shared_secret(&navigator.kex_pub()).unwrap();
        assert_eq!(a, b);

        // Hashed, never the raw agreement output
        let raw = StaticSecret::from(*navigator.kex_secret_bytes())
            .diffie_hellman(&X25519PublicKey::from(mate.kex_pub()));
        assert_ne!(&a, raw.as_bytes());
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let navigator = Identity::generate();
        assert_eq!(
            navigator.derive_shared_secret(&[0u8; 32]),
            Err(IdentityError::NonContributory)
        );
    }

    #[test]
    fn test_from_bytes_round_trip() {
        let original = Identity::generate();
        let restored = Identity::from_bytes(&original.sign_seed(), &original.kex_secret_bytes());

        assert_eq!(original.sign_pub(), restored.sign_pub());
        assert_eq!(original.kex_pub(), restored.kex_pub());
        assert_eq!(original.sign(b"x"), restored.sign(b"x"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let identity = Identity::generate();
        let dbg = format!("{identity:?}");
        assert!(dbg.contains(&identity.sign_pub_b64()));
        assert!(!dbg.contains(&hex::encode(*identity.sign_seed())));
    }
}
