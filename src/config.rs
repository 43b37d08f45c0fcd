// ABOUTME: Configuration for the management connection pool
//
// Defines PoolConfig with every tunable of the pool:
// - Helper executable location
// - Handshake socket location and server naming
// - Timeouts for the handshake, endpoint connect and helper detach
// - Peer credential checking and logging

//! Pool configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LoggingConfig;

/// Default helper executable name, looked up on PATH
pub const DEFAULT_HELPER: &str = "mgmt-pool-helper";

/// Configuration for the connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Helper executable; a bare name is resolved on PATH
    pub helper_path: PathBuf,

    // === Handshake channel ===
    /// Directory for handshake sockets (default: ~/.mgmt-pool/sockets/)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,

    /// Prefix for the per-pool unique server name
    pub server_name_prefix: String,

    /// Check that a helper's peer credentials belong to the process owner
    pub verify_peer_owner: bool,

    // === Timeouts ===
    /// Time allowed from helper spawn until it reports its endpoint
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,

    /// Time allowed to open the management endpoint once it is known
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Time to wait for a helper to exit after `detach`
    #[serde(with = "duration_millis")]
    pub detach_timeout: Duration,

    /// Logging setup used by `logging::init_logging`
    pub logging: LoggingConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from(DEFAULT_HELPER),

            // Socket location determined at runtime via get_socket_dir()
            socket_dir: None,
            server_name_prefix: "mgmt-pool-".to_string(),
            verify_peer_owner: true,

            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            detach_timeout: Duration::from_secs(5),

            logging: LoggingConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load `~/.mgmt-pool/config.toml` if present, otherwise defaults
    pub fn load_or_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize pool config")
    }

    /// Get the socket directory, creating it if needed
    ///
    /// Returns `~/.mgmt-pool/sockets/` by default. Helpers may run as other
    /// users, so the directory is traversable (0711) but not listable.
    pub fn get_socket_dir(&self) -> std::io::Result<PathBuf> {
        let socket_dir = self
            .socket_dir
            .clone()
            .unwrap_or_else(|| base_dir().join("sockets"));

        ensure_socket_dir(&socket_dir)?;
        Ok(socket_dir)
    }

    /// Full handshake socket path for a server name
    pub fn get_socket_path(&self, server_name: &str) -> std::io::Result<PathBuf> {
        Ok(self.get_socket_dir()?.join(format!("{server_name}.sock")))
    }

    /// Generate a fresh unique server name for one pool instance
    pub fn unique_server_name(&self) -> String {
        format!("{}{}", self.server_name_prefix, uuid::Uuid::new_v4().simple())
    }

    /// Resolve the helper executable, searching PATH for bare names
    pub fn resolve_helper_path(&self) -> std::io::Result<PathBuf> {
        if self.helper_path.components().count() > 1 || self.helper_path.is_absolute() {
            return Ok(self.helper_path.clone());
        }
        which::which(&self.helper_path).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("helper '{}' not found: {e}", self.helper_path.display()),
            )
        })
    }
}

/// `~/.mgmt-pool`
fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mgmt-pool")
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    base_dir().join("config.toml")
}

/// Ensure socket directory exists (mode 0711)
fn ensure_socket_dir(socket_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o711); // rwx--x--x
        std::fs::set_permissions(socket_dir, perms)?;
    }

    Ok(())
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
