//! Fleet Navigator pairing core.
//!
//! This crate holds the stateful half of the pairing subsystem: the
//! Navigator identity on disk, the trusted-device store, the in-memory
//! session registry and the [`pairing::PairingCoordinator`] that ties them
//! together. Transport lives in `fleet-navigator`.

#![forbid(unsafe_code)]

pub mod errors;
pub mod identity;
pub mod pairing;
pub mod registry;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use errors::{AuthFailure, PairingError};
pub use identity::{default_data_dir, IdentityFile};
pub use pairing::{AuthOutcome, CoordinatorConfig, PairingCoordinator, PairingSummary};
pub use registry::{ChallengeCheck, PendingRequest, SessionRegistry};
pub use store::{DeviceStore, InMemoryStore, StoreError, TrustedDevice};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;
