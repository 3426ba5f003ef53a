//! Storage abstraction for trusted devices.
//!
//! This module defines the `DeviceStore` trait and provides an in-memory
//! implementation for tests and ephemeral deployments. A SQLite backend
//! lives in `sqlite_store` behind the `sqlite` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),
}

// ============================================================================
// Data Models
// ============================================================================

/// A Mate that completed pairing.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustedDevice {
    /// Unique id derived from type and name, e.g. `os-build-box-1`
    pub device_id: String,
    /// Display name reported by the Mate
    pub name: String,
    /// Mate kind (`os`, `mail`, `office`, `browser`, ...)
    pub device_type: String,
    /// Raw Ed25519 public key, base64
    pub public_key: String,
    /// Raw X25519 public key, base64
    pub exchange_key: String,
    /// Session key derived at approval time and reused for every session
    pub shared_secret: [u8; 32],
    pub paired_at: DateTime<Utc>,
    pub last_auth_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Disabled devices keep their record but cannot authenticate
    pub enabled: bool,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl std::fmt::Debug for TrustedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedDevice")
            .field("device_id", &self.device_id)
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("public_key", &self.public_key)
            .field("paired_at", &self.paired_at)
            .field("last_auth_at", &self.last_auth_at)
            .field("last_seen_at", &self.last_seen_at)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable storage of trusted devices.
///
/// Implementations must be safe to call from many connection tasks at once.
/// Failures are reported, never retried here.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Look a device up by its id.
    async fn find_by_id(&self, device_id: &str) -> Result<Option<TrustedDevice>, StoreError>;

    /// Look a device up by its raw base64 signing key.
    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<TrustedDevice>, StoreError>;

    /// Whether a device id is taken.
    async fn exists(&self, device_id: &str) -> Result<bool, StoreError>;

    /// Insert a new device.
    ///
    /// # Returns
    /// * `Err(StoreError::AlreadyExists)` if the id or the public key is already stored
    async fn insert(&self, device: TrustedDevice) -> Result<(), StoreError>;

    /// Stamp a successful authentication. Returns `false` if the device is gone.
    async fn mark_authenticated(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Stamp a heartbeat. Returns `false` if the device is gone.
    async fn mark_seen(&self, device_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Enable or disable a device. Returns `false` if the device is gone.
    async fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<bool, StoreError>;

    /// Delete one device. Returns whether it existed.
    async fn delete(&self, device_id: &str) -> Result<bool, StoreError>;

    /// Delete every device. Returns the number removed.
    async fn delete_all(&self) -> Result<usize, StoreError>;

    /// All devices, ordered by pairing time.
    async fn list(&self) -> Result<Vec<TrustedDevice>, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// In-memory store, lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    devices: Arc<RwLock<HashMap<String, TrustedDevice>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, device_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TrustedDevice),
    {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn find_by_id(&self, device_id: &str) -> Result<Option<TrustedDevice>, StoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn find_by_public_key(
        &self,
        public_key: &str,
    ) -> Result<Option<TrustedDevice>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices.values().find(|d| d.public_key == public_key).cloned())
    }

    async fn exists(&self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.devices.read().await.contains_key(device_id))
    }

    async fn insert(&self, device: TrustedDevice) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.device_id) {
            return Err(StoreError::AlreadyExists(device.device_id));
        }
        if devices.values().any(|d| d.public_key == device.public_key) {
            return Err(StoreError::AlreadyExists(device.public_key));
        }
        devices.insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn mark_authenticated(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .update(device_id, |d| {
                d.last_auth_at = Some(at);
                d.last_seen_at = Some(at);
            })
            .await)
    }

    async fn mark_seen(&self, device_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.update(device_id, |d| d.last_seen_at = Some(at)).await)
    }

    async fn set_enabled(&self, device_id: &str, enabled: bool) -> Result<bool, StoreError> {
        Ok(self.update(device_id, |d| d.enabled = enabled).await)
    }

    async fn delete(&self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.devices.write().await.remove(device_id).is_some())
    }

    async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut devices = self.devices.write().await;
        let count = devices.len();
        devices.clear();
        Ok(count)
    }

    async fn list(&self) -> Result<Vec<TrustedDevice>, StoreError> {
        let mut all: Vec<_> = self.devices.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.paired_at
                .cmp(&b.paired_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(all)
    }
}
