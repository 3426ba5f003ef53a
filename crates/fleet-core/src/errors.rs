//! Error types for the pairing coordinator.
//!
//! `PairingError` goes to the local caller (operator API, gateway). Failed
//! authentication is not an error in that sense: it is an ordinary outcome,
//! described by `AuthFailure`, whose detail stays in the local log.

use thiserror::Error;

use fleet_crypto::{IdentityError as CryptoError, KeyError};

use crate::store::StoreError;

/// Errors surfaced to the caller of a coordinator operation.
#[derive(Debug, Error)]
pub enum PairingError {
    /// No pending request with this id
    #[error("pairing request not found: {0}")]
    NotFound(String),

    /// The request outlived its TTL
    #[error("pairing request expired: {0}")]
    Expired(String),

    /// The signing key already belongs to a trusted device
    #[error("device already paired: {0}")]
    AlreadyPaired(String),

    #[error("invalid pairing request: {0}")]
    InvalidRequest(String),

    #[error("invalid public key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("key agreement failed: {0}")]
    KeyAgreement(#[from] CryptoError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PairingError {
    /// Whether the error concerns a missing or stale request rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PairingError::NotFound(_) | PairingError::Expired(_))
    }
}

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("unknown device")]
    UnknownDevice,
    #[error("device disabled")]
    Disabled,
    #[error("malformed public key")]
    MalformedKey,
    #[error("public key mismatch")]
    KeyMismatch,
    #[error("no outstanding challenge")]
    NoChallenge,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("nonce expired")]
    NonceExpired,
    #[error("invalid signature")]
    BadSignature,
}

impl AuthFailure {
    /// Text sent to the remote peer. Identical for every cause.
    pub const WIRE_MESSAGE: &'static str = "Authentication failed";

    pub fn wire_message(&self) -> &'static str {
        Self::WIRE_MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_hides_cause() {
        let causes = [
            AuthFailure::UnknownDevice,
            AuthFailure::Disabled,
            AuthFailure::MalformedKey,
            AuthFailure::KeyMismatch,
            AuthFailure::NoChallenge,
            AuthFailure::NonceMismatch,
            AuthFailure::NonceExpired,
            AuthFailure::BadSignature,
        ];
        for cause in causes {
            assert_eq!(cause.wire_message(), "Authentication failed");
        }
        assert_eq!(AuthFailure::UnknownDevice.to_string(), "unknown device");
    }

    #[test]
    fn not_found_classification() {
        assert!(PairingError::NotFound("r".into()).is_not_found());
        assert!(PairingError::Expired("r".into()).is_not_found());
        assert!(!PairingError::AlreadyPaired("os-a".into()).is_not_found());
    }
}
