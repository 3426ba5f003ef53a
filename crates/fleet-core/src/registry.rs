//! In-memory session state shared by every connection.
//!
//! Pending pairing requests, outstanding challenges and live session keys
//! each live in their own `DashMap`, so work for different devices never
//! contends on a single lock.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use fleet_crypto::utils::constant_time_str_eq;

/// A pairing request waiting for an operator decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: String,
    pub name: String,
    pub device_type: String,
    /// Raw Ed25519 key, base64
    pub public_key: String,
    /// Raw X25519 key, base64
    pub exchange_key: String,
    pub pairing_code: String,
    pub fingerprint: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
struct Challenge {
    nonce: String,
    issued_at: Instant,
}

/// Result of presenting a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeCheck {
    /// Matched and consumed
    Valid,
    /// Matched, but older than the TTL; consumed
    Expired,
    /// A different nonce is outstanding
    Mismatch,
    /// No challenge was issued, or it was already used
    Missing,
}

/// Constructed once at startup and shared by the coordinator and gateway.
#[derive(Default)]
pub struct SessionRegistry {
    pending: DashMap<String, PendingRequest>,
    challenges: DashMap<String, Challenge>,
    sessions: DashMap<String, [u8; 32]>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Pending pairing requests
    // -------------------------------------------------------------------------

    /// Store a request, dropping any earlier request for the same signing key.
    ///
    /// Returns the id of the request that was replaced, if any.
    pub fn insert_pending(&self, request: PendingRequest) -> Option<String> {
        let mut replaced = None;
        self.pending.retain(|id, existing| {
            if existing.public_key == request.public_key {
                replaced = Some(id.clone());
                false
            } else {
                true
            }
        });
        self.pending.insert(request.request_id.clone(), request);
        replaced
    }

    /// Remove and return a request. At most one caller ever receives it.
    pub fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id).map(|(_, req)| req)
    }

    pub fn get_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.get(request_id).map(|entry| entry.value().clone())
    }

    /// Drop expired requests and return the rest, oldest first.
    pub fn pending_snapshot(&self, now: DateTime<Utc>) -> Vec<PendingRequest> {
        self.pending.retain(|id, req| {
            let keep = !req.is_expired(now);
            if !keep {
                debug!(request_id = %id, "Pairing request expired");
            }
            keep
        });
        let mut all: Vec<_> = self.pending.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|req| req.created_at);
        all
    }

    // -------------------------------------------------------------------------
    // Authentication challenges
    // -------------------------------------------------------------------------

    /// Record a fresh nonce for a device, superseding any outstanding one.
    ///
    /// Expired challenges of other devices are swept at the same time.
    pub fn issue_challenge(&self, device_id: &str, nonce: String, ttl: Duration) {
        self.challenges
            .retain(|_, challenge| challenge.issued_at.elapsed() < ttl);
        self.challenges.insert(
            device_id.to_string(),
            Challenge {
                nonce,
                issued_at: Instant::now(),
            },
        );
    }

    /// Present a nonce. A matching nonce is removed whatever happens next.
    pub fn consume_challenge(&self, device_id: &str, nonce: &str, ttl: Duration) -> ChallengeCheck {
        let taken = self
            .challenges
            .remove_if(device_id, |_, challenge| constant_time_str_eq(&challenge.nonce, nonce));

        match taken {
            Some((_, challenge)) if challenge.issued_at.elapsed() >= ttl => ChallengeCheck::Expired,
            Some(_) => ChallengeCheck::Valid,
            None if self.challenges.contains_key(device_id) => ChallengeCheck::Mismatch,
            None => ChallengeCheck::Missing,
        }
    }

    pub fn clear_challenge(&self, device_id: &str) {
        self.challenges.remove(device_id);
    }

    pub fn has_challenge(&self, device_id: &str) -> bool {
        self.challenges.contains_key(device_id)
    }

    // -------------------------------------------------------------------------
    // Active sessions
    // -------------------------------------------------------------------------

    pub fn install_session(&self, device_id: &str, secret: [u8; 32]) {
        self.sessions.insert(device_id.to_string(), secret);
    }

    /// The session key, or `None` if the session ended (possibly concurrently).
    pub fn session_secret(&self, device_id: &str) -> Option<[u8; 32]> {
        self.sessions.get(device_id).map(|entry| *entry.value())
    }

    pub fn is_authenticated(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    /// Returns whether a session existed.
    pub fn end_session(&self, device_id: &str) -> bool {
        self.sessions.remove(device_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything: sessions, challenges and pending requests.
    pub fn clear(&self) {
        self.sessions.clear();
        self.challenges.clear();
        self.pending.clear();
    }
}
