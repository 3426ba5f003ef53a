use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use fleet_core::identity::{default_data_dir, IDENTITY_FILE_NAME};
use fleet_core::CoordinatorConfig;

/// Database path value that selects the in-memory store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigatorConfig {
    pub bind_addr: SocketAddr,

    // Storage
    pub data_dir: PathBuf,
    pub identity_file: Option<PathBuf>,
    pub database_path: Option<PathBuf>,

    // Admin API bearer token; unset leaves the API open
    pub admin_token: Option<String>,

    // Pairing and authentication
    pub pairing_ttl_secs: u64,
    pub challenge_ttl_secs: u64,

    // Transport
    pub max_frame_bytes: usize,

    // Graceful shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2025)),
            data_dir: default_data_dir(),
            identity_file: None,
            database_path: None,
            admin_token: None,
            pairing_ttl_secs: 24 * 60 * 60, // 24 hours
            challenge_ttl_secs: 300,        // 5 minutes
            max_frame_bytes: 1024 * 1024,   // 1MB
            shutdown_timeout_secs: 30,
        }
    }
}

impl NavigatorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FLEET_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }

        if let Ok(dir) = std::env::var("FLEET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("FLEET_IDENTITY_FILE") {
            config.identity_file = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("FLEET_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Ok(token) = std::env::var("FLEET_ADMIN_TOKEN") {
            let token = token.trim().to_string();
            config.admin_token = (!token.is_empty()).then_some(token);
        }

        if let Ok(ttl) = std::env::var("FLEET_PAIRING_TTL_SECS") {
            config.pairing_ttl_secs = ttl.parse()?;
        }

        if let Ok(ttl) = std::env::var("FLEET_CHALLENGE_TTL_SECS") {
            config.challenge_ttl_secs = ttl.parse()?;
        }

        if let Ok(size) = std::env::var("FLEET_MAX_FRAME_BYTES") {
            config.max_frame_bytes = size.parse()?;
        }

        if let Ok(secs) = std::env::var("FLEET_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = secs.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NavigatorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// TOML file named by `FLEET_CONFIG_PATH`, otherwise the environment.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("FLEET_CONFIG_PATH") {
            Self::from_toml(path)
        } else {
            Self::from_env()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pairing_ttl_secs == 0 {
            anyhow::bail!("pairing_ttl_secs must be > 0");
        }

        if self.challenge_ttl_secs == 0 {
            anyhow::bail!("challenge_ttl_secs must be > 0");
        }

        if self.max_frame_bytes < 1024 {
            anyhow::bail!("max_frame_bytes must be at least 1024");
        }

        if let Some(token) = &self.admin_token {
            if token.len() < 16 {
                anyhow::bail!("admin_token must be at least 16 characters");
            }
        }

        Ok(())
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(IDENTITY_FILE_NAME))
    }

    /// SQLite file to open, or `None` for the in-memory store.
    ///
    /// Unset falls back to `trusted_devices.db` in the data directory.
    pub fn database(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) if path.as_os_str() == IN_MEMORY_DATABASE => None,
            Some(path) => Some(path.clone()),
            None => Some(self.data_dir.join("trusted_devices.db")),
        }
    }

    pub fn pairing_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_ttl_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            pairing_ttl: self.pairing_ttl(),
            challenge_ttl: self.challenge_ttl(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = NavigatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr.port(), 2025);
        assert_eq!(config.challenge_ttl(), Duration::from_secs(300));
        assert_eq!(config.pairing_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_validation_errors() {
        let config = NavigatorConfig {
            challenge_ttl_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NavigatorConfig {
            max_frame_bytes: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NavigatorConfig {
            admin_token: Some("short".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("navigator.toml");
        std::fs::write(
            &path,
            r#"
bind_addr = "127.0.0.1:9000"
data_dir = "/var/lib/fleet"
challenge_ttl_secs = 60
"#,
        )
        .unwrap();

        let config = NavigatorConfig::from_toml(&path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.challenge_ttl_secs, 60);
        assert_eq!(config.pairing_ttl_secs, 86_400);
        assert_eq!(
            config.identity_path(),
            PathBuf::from("/var/lib/fleet").join("navigator_keys.json")
        );
        assert_eq!(
            config.database(),
            Some(PathBuf::from("/var/lib/fleet").join("trusted_devices.db"))
        );
    }

    #[test]
    fn test_in_memory_database() {
        let config = NavigatorConfig {
            database_path: Some(PathBuf::from(":memory:")),
            ..Default::default()
        };
        assert_eq!(config.database(), None);
    }
}
