use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use veil_fs::{DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
use veil_policy::{EngineConfig, PolicyConfig};

use crate::error::{RootError, RootResult};

/// Settings for the control plane listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Listen address. Must be loopback: the endpoint has no authentication
    /// of its own.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9494
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ControlConfig {
    pub fn socket_addr(&self) -> RootResult<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|_| RootError::Config(format!("invalid bind address '{}'", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Settings for directory listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingConfig {
    /// Size in bytes of the per-handle raw record buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Top-level configuration for the veil binary.
///
/// Loaded from a TOML file (typically `~/.veil/config.toml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VeilConfig {
    /// Directory holding `<issuer>.priv`, `<issuer>.pub` and `<issuer>.pub.jwk`.
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub listing: ListingConfig,
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            control: ControlConfig::default(),
            policy: PolicyConfig::default(),
            engine: EngineConfig::default(),
            listing: ListingConfig::default(),
        }
    }
}

impl VeilConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: VeilConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RootResult<()> {
        let addr = self.control.socket_addr()?;
        if !addr.ip().is_loopback() {
            return Err(RootError::Config(format!(
                "control.bind must be a loopback address, got '{}'",
                self.control.bind
            )));
        }
        if self.listing.buffer_size < MIN_BUFFER_SIZE {
            return Err(RootError::Config(format!(
                "listing.buffer_size must be at least {}, got {}",
                MIN_BUFFER_SIZE, self.listing.buffer_size
            )));
        }
        self.policy.validate()?;
        self.engine.validate()?;
        Ok(())
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".veil/config.toml")
    }
}
