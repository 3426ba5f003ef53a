//! Wire format for the Navigator <-> Mate WebSocket channel.
//!
//! Every frame is a JSON object with a `type` discriminant. Inbound frames
//! are decoded once, through [`inbound::Inbound::parse`], into a canonical
//! enum; the many field spellings used by different Mate implementations
//! never leak past that boundary. Outbound frames are always emitted as
//! `{"type": ..., "payload": {...}}` with camelCase keys.

#![forbid(unsafe_code)]

pub mod inbound;
pub mod outbound;

pub use inbound::{AuthRequest, BusinessMessage, EncryptedFrame, FrameError, Inbound, PairingRequest};
pub use outbound::{Outbound, PairingStatus};

/// Discriminant of the encrypted envelope frame.
pub const ENCRYPTED: &str = "encrypted";
