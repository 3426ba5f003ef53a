//! Persistence of the Navigator's long-term identity.
//!
//! The keys live in one JSON file (`navigator_keys.json`) that is created on
//! first start and only ever read afterwards. Any failure here is fatal to
//! the process: without a stable identity no paired Mate could ever
//! authenticate again.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use fleet_crypto::Identity;

/// File name of the identity inside the data directory.
pub const IDENTITY_FILE_NAME: &str = "navigator_keys.json";

/// Platform data directory, or `./.fleet-navigator` when none can be determined.
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "javafleet", "fleet-navigator")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".fleet-navigator"))
}

/// The Navigator identity could not be loaded or created.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported identity file version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid key data: {0}")]
    InvalidKeyData(String),
}

/// On-disk form of the identity.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u32,
    /// Ed25519 private key seed, hex
    sign_seed: String,
    /// X25519 private key, hex
    kex_secret: String,
    /// RFC 3339
    created_at: String,
}

impl StoredIdentity {
    const CURRENT_VERSION: u32 = 1;

    fn new(identity: &Identity, created_at: DateTime<Utc>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            sign_seed: hex::encode(*identity.sign_seed()),
            kex_secret: hex::encode(*identity.kex_secret_bytes()),
            created_at: created_at.to_rfc3339(),
        }
    }

    fn into_identity(self) -> Result<Identity, IdentityError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(IdentityError::UnsupportedVersion(self.version));
        }
        let sign_seed = decode_secret("sign_seed", &self.sign_seed)?;
        let kex_secret = decode_secret("kex_secret", &self.kex_secret)?;
        Ok(Identity::from_bytes(&sign_seed, &kex_secret))
    }
}

fn decode_secret(field: &str, value: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = hex::decode(value)
        .map_err(|e| IdentityError::InvalidKeyData(format!("invalid {field} hex: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        IdentityError::InvalidKeyData(format!(
            "invalid {field} length: expected 32, got {}",
            bytes.len()
        ))
    })
}

/// The identity file at a fixed path.
#[derive(Debug, Clone)]
pub struct IdentityFile {
    path: PathBuf,
}

impl IdentityFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Identity file inside `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(IDENTITY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the identity, generating and persisting a new one on first run.
    pub fn load_or_generate(&self) -> Result<Identity, IdentityError> {
        if let Some(identity) = self.load()? {
            debug!(path = %self.path.display(), "Loaded navigator identity");
            return Ok(identity);
        }

        let identity = Identity::generate();
        self.store(&identity)?;
        info!(
            path = %self.path.display(),
            public_key = %identity.sign_pub_b64(),
            "Generated new navigator identity"
        );
        Ok(identity)
    }

    /// `Ok(None)` if the file does not exist yet.
    pub fn load(&self) -> Result<Option<Identity>, IdentityError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        let stored: StoredIdentity = serde_json::from_str(&contents)?;
        stored.into_identity().map(Some)
    }

    /// Write atomically with owner-only permissions.
    pub fn store(&self, identity: &Identity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let json = serde_json::to_string_pretty(&StoredIdentity::new(identity, Utc::now()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = open_private(&temp_path).map_err(|e| self.io_error(e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| self.io_error(e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .map_err(|e| self.io_error(e))?;
        }

        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
