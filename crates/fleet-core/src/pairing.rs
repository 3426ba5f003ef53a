//! Pairing coordinator.
//!
//! Runs the pairing ceremony and challenge-response authentication:
//!
//! ```text
//!   pairing_request ──► PENDING ──approve──► APPROVED (trusted device stored)
//!                          │ ├──reject───► REJECTED
//!                          │ └──24h──────► EXPIRED (dropped on next read)
//!                          └─ key already trusted ─► ALREADY_PAIRED
//!
//!   auth_challenge_request ──► nonce ──auth(sig over "id:nonce")──► session
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_crypto::codes::{fingerprint, generate_nonce, pairing_code};
use fleet_crypto::identity::verify_signature_b64;
use fleet_crypto::keys::{decode_public_key, encode_public_key};
use fleet_crypto::utils::constant_time_compare;
use fleet_crypto::Identity;
use fleet_proto::outbound::PairingResponse;
use fleet_proto::{PairingRequest, PairingStatus};

use crate::errors::{AuthFailure, PairingError};
use crate::registry::{ChallengeCheck, PendingRequest, SessionRegistry};
use crate::store::{DeviceStore, StoreError, TrustedDevice};

/// Default lifetime of a pending pairing request.
pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of an authentication challenge.
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(300);

/// Timing knobs of the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub pairing_ttl: Duration,
    pub challenge_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pairing_ttl: DEFAULT_PAIRING_TTL,
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
        }
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success {
        device_id: String,
        device_name: String,
    },
    Failed(AuthFailure),
}

impl AuthOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AuthOutcome::Success { .. })
    }
}

/// Counts for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingSummary {
    pub trusted: usize,
    pub pending: usize,
    pub active_sessions: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// Orchestrates pairing, challenges and sessions.
pub struct PairingCoordinator {
    identity: Arc<Identity>,
    store: Arc<dyn DeviceStore>,
    registry: Arc<SessionRegistry>,
    config: CoordinatorConfig,
}

impl PairingCoordinator {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<dyn DeviceStore>,
        registry: Arc<SessionRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            identity,
            store,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Navigator signing key, raw base64.
    pub fn navigator_public_key(&self) -> String {
        self.identity.sign_pub_b64()
    }

    /// Navigator exchange key, raw base64.
    pub fn navigator_exchange_key(&self) -> String {
        self.identity.kex_pub_b64()
    }

    // -------------------------------------------------------------------------
    // Pairing ceremony
    // -------------------------------------------------------------------------

    /// Register a pairing request, or short-circuit if the key is already trusted.
    pub async fn create_pairing_request(
        &self,
        request: PairingRequest,
    ) -> Result<PairingResponse, PairingError> {
        if request.name.trim().is_empty() || request.device_type.trim().is_empty() {
            return Err(PairingError::InvalidRequest(
                "name and type are required".into(),
            ));
        }
        let sign_key = decode_public_key(&request.public_key)?;
        let kex_key = decode_public_key(&request.exchange_key)?;
        let public_key = encode_public_key(&sign_key);
        let navigator_public_key = self.navigator_public_key();

        if let Some(existing) = self.store.find_by_public_key(&public_key).await? {
            info!(device_id = %existing.device_id, "Pairing request from already trusted device");
            return Ok(PairingResponse {
                request_id: None,
                device_id: Some(existing.device_id),
                pairing_code: None,
                navigator_public_key,
                navigator_exchange_key: self.navigator_exchange_key(),
                status: PairingStatus::AlreadyPaired,
            });
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.pairing_ttl)
            .map_err(|_| PairingError::InvalidRequest("pairing TTL out of range".into()))?;
        let pending = PendingRequest {
            request_id: Uuid::new_v4().to_string(),
            name: request.name,
            device_type: request.device_type,
            pairing_code: pairing_code(&public_key, &navigator_public_key),
            fingerprint: fingerprint(&sign_key),
            public_key,
            exchange_key: encode_public_key(&kex_key),
            ipv4: request.ipv4,
            ipv6: request.ipv6,
            created_at: now,
            expires_at: now + ttl,
        };

        info!(
            request_id = %pending.request_id,
            name = %pending.name,
            device_type = %pending.device_type,
            fingerprint = %pending.fingerprint,
            pairing_code = %pending.pairing_code,
            "Pairing request created"
        );

        let response = PairingResponse {
            request_id: Some(pending.request_id.clone()),
            device_id: None,
            pairing_code: Some(pending.pairing_code.clone()),
            navigator_public_key,
            navigator_exchange_key: self.navigator_exchange_key(),
            status: PairingStatus::Pending,
        };

        if let Some(replaced) = self.registry.insert_pending(pending) {
            debug!(replaced_request = %replaced, "Superseded earlier pairing request for the same key");
        }

        Ok(response)
    }

    /// Pending requests, after dropping expired ones.
    pub fn list_pending(&self) -> Vec<PendingRequest> {
        self.registry.pending_snapshot(Utc::now())
    }

    /// Approve a pending request and persist the new trusted device.
    ///
    /// The request is consumed before anything else happens, so concurrent or
    /// repeated approvals of one id produce exactly one device.
    pub async fn approve_pairing(&self, request_id: &str) -> Result<TrustedDevice, PairingError> {
        let pending = self
            .registry
            .take_pending(request_id)
            .ok_or_else(|| PairingError::NotFound(request_id.to_string()))?;

        if pending.is_expired(Utc::now()) {
            info!(request_id, "Refusing to approve expired pairing request");
            return Err(PairingError::Expired(request_id.to_string()));
        }

        match self.persist_device(&pending).await {
            Ok(device) => {
                info!(
                    request_id,
                    device_id = %device.device_id,
                    name = %device.name,
                    "Pairing approved"
                );
                Ok(device)
            }
            Err(e @ PairingError::Store(_)) => {
                // Leave the request approvable once the store recovers
                warn!(request_id, error = %e, "Failed to persist trusted device");
                self.registry.insert_pending(pending);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn persist_device(&self, pending: &PendingRequest) -> Result<TrustedDevice, PairingError> {
        if let Some(existing) = self.store.find_by_public_key(&pending.public_key).await? {
            return Err(PairingError::AlreadyPaired(existing.device_id));
        }

        let shared_secret = self.identity.derive_shared_secret_b64(&pending.exchange_key)?;
        let base = device_id_base(&pending.device_type, &pending.name);

        let mut suffix = 0u32;
        loop {
            let candidate = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            suffix += 1;

            if self.store.exists(&candidate).await? {
                continue;
            }

            let device = TrustedDevice {
                device_id: candidate,
                name: pending.name.clone(),
                device_type: pending.device_type.clone(),
                public_key: pending.public_key.clone(),
                exchange_key: pending.exchange_key.clone(),
                shared_secret,
                paired_at: Utc::now(),
                last_auth_at: None,
                last_seen_at: None,
                enabled: true,
                ipv4: pending.ipv4.clone(),
                ipv6: pending.ipv6.clone(),
            };

            match self.store.insert(device.clone()).await {
                Ok(()) => return Ok(device),
                // Lost a race for this id; try the next suffix
                Err(StoreError::AlreadyExists(_)) => {
                    if let Some(existing) = self.store.find_by_public_key(&pending.public_key).await? {
                        return Err(PairingError::AlreadyPaired(existing.device_id));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop a pending request. Returns the request if it was still pending.
    pub fn reject_pairing(&self, request_id: &str) -> Option<PendingRequest> {
        let removed = self.registry.take_pending(request_id);
        match &removed {
            Some(req) => info!(request_id, name = %req.name, "Pairing rejected"),
            None => debug!(request_id, "Reject for unknown pairing request"),
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Challenge-response authentication
    // -------------------------------------------------------------------------

    /// Issue a fresh nonce, replacing any outstanding one for the device.
    pub fn generate_challenge(&self, device_id: &str) -> String {
        let nonce = generate_nonce();
        self.registry
            .issue_challenge(device_id, nonce.clone(), self.config.challenge_ttl);
        debug!(device_id, "Issued authentication challenge");
        nonce
    }

    /// Verify a signed challenge and open a session.
    ///
    /// Checks run in a fixed order: device exists, is enabled, the key
    /// matches, the nonce is the outstanding one, the signature over
    /// `"{device_id}:{nonce}"` verifies. `Err` is reserved for store faults.
    pub async fn authenticate(
        &self,
        device_id: &str,
        public_key: &str,
        signature: &str,
        nonce: &str,
    ) -> Result<AuthOutcome, PairingError> {
        let device = match self.store.find_by_id(device_id).await? {
            Some(device) => device,
            None => return Ok(self.refuse(device_id, AuthFailure::UnknownDevice)),
        };

        if !device.enabled {
            return Ok(self.refuse(device_id, AuthFailure::Disabled));
        }

        let supplied = match decode_public_key(public_key) {
            Ok(key) => key,
            Err(_) => return Ok(self.refuse(device_id, AuthFailure::MalformedKey)),
        };
        let key_matches = decode_public_key(&device.public_key)
            .map(|stored| constant_time_compare(&stored, &supplied))
            .unwrap_or(false);
        if !key_matches {
            return Ok(self.refuse(device_id, AuthFailure::KeyMismatch));
        }

        match self
            .registry
            .consume_challenge(device_id, nonce, self.config.challenge_ttl)
        {
            ChallengeCheck::Valid => {}
            ChallengeCheck::Expired => return Ok(self.refuse(device_id, AuthFailure::NonceExpired)),
            ChallengeCheck::Mismatch => return Ok(self.refuse(device_id, AuthFailure::NonceMismatch)),
            ChallengeCheck::Missing => return Ok(self.refuse(device_id, AuthFailure::NoChallenge)),
        }

        let message = format!("{device_id}:{nonce}");
        if verify_signature_b64(public_key, message.as_bytes(), signature).is_err() {
            return Ok(self.refuse(device_id, AuthFailure::BadSignature));
        }

        self.registry.install_session(device_id, device.shared_secret);
        match self.store.mark_authenticated(device_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                // Revoked while we were verifying
                self.registry.end_session(device_id);
                return Ok(self.refuse(device_id, AuthFailure::UnknownDevice));
            }
            Err(e) => {
                self.registry.end_session(device_id);
                return Err(e.into());
            }
        }

        info!(device_id, name = %device.name, "Device authenticated");
        Ok(AuthOutcome::Success {
            device_id: device.device_id,
            device_name: device.name,
        })
    }

    fn refuse(&self, device_id: &str, cause: AuthFailure) -> AuthOutcome {
        warn!(device_id, %cause, "Authentication failed");
        AuthOutcome::Failed(cause)
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    pub fn is_authenticated(&self, device_id: &str) -> bool {
        self.registry.is_authenticated(device_id)
    }

    pub fn session_secret(&self, device_id: &str) -> Option<[u8; 32]> {
        self.registry.session_secret(device_id)
    }

    pub fn end_session(&self, device_id: &str) {
        if self.registry.end_session(device_id) {
            debug!(device_id, "Session ended");
        }
    }

    // -------------------------------------------------------------------------
    // Trusted devices
    // -------------------------------------------------------------------------

    pub async fn list_trusted(&self) -> Result<Vec<TrustedDevice>, PairingError> {
        Ok(self.store.list().await?)
    }

    pub async fn find_trusted(&self, device_id: &str) -> Result<Option<TrustedDevice>, PairingError> {
        Ok(self.store.find_by_id(device_id).await?)
    }

    /// Record a heartbeat. Returns `false` for unknown devices.
    pub async fn touch_last_seen(&self, device_id: &str) -> Result<bool, PairingError> {
        Ok(self.store.mark_seen(device_id, Utc::now()).await?)
    }

    /// Enable or disable a device; disabling ends its session.
    pub async fn set_device_enabled(&self, device_id: &str, enabled: bool) -> Result<bool, PairingError> {
        let found = self.store.set_enabled(device_id, enabled).await?;
        if found && !enabled {
            self.end_session(device_id);
            self.registry.clear_challenge(device_id);
        }
        if found {
            info!(device_id, enabled, "Device enabled flag changed");
        }
        Ok(found)
    }

    /// Forget one device. Returns whether it was stored.
    pub async fn revoke_device(&self, device_id: &str) -> Result<bool, PairingError> {
        self.end_session(device_id);
        self.registry.clear_challenge(device_id);
        let removed = self.store.delete(device_id).await?;
        if removed {
            info!(device_id, "Trusted device revoked");
        }
        Ok(removed)
    }

    /// Forget every device, session, challenge and pending request.
    pub async fn revoke_all(&self) -> Result<usize, PairingError> {
        self.registry.clear();
        let removed = self.store.delete_all().await?;
        info!(removed, "All trusted devices revoked");
        Ok(removed)
    }

    pub async fn summary(&self) -> Result<PairingSummary, PairingError> {
        let trusted = self.store.list().await?;
        let mut by_type = BTreeMap::new();
        for device in &trusted {
            *by_type.entry(device.device_type.clone()).or_insert(0) += 1;
        }
        Ok(PairingSummary {
            trusted: trusted.len(),
            pending: self.list_pending().len(),
            active_sessions: self.registry.session_count(),
            by_type,
        })
    }
}

/// `type-name`. The name is lowercased with everything outside `[a-z0-9]`
/// turned into `-`; the type is kept as reported.
pub fn device_id_base(device_type: &str, name: &str) -> String {
    let name: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect();
    format!("{device_type}-{name}")
}
