//! Cryptographic building blocks for the Navigator pairing protocol.
//!
//! Everything here is pure and synchronous: long-term identity keys,
//! public key normalization, the AES-256-GCM envelope cipher, and the
//! human-verifiable pairing code and fingerprint.

#![forbid(unsafe_code)]

pub mod hash;
pub mod keys;
pub mod identity;
pub mod cipher;
pub mod codes;
pub mod utils;

#[cfg(test)]
mod proptests;

pub use cipher::CipherError;
pub use identity::{Identity, IdentityError};
pub use keys::{normalize_public_key, KeyError, KeyKind};
